//! Blocking wrapper over the async session for sync callers.
//!
//! Owns a small private runtime so reconnection timers and notification
//! dispatch keep running between calls.

use std::future::Future;

use tokio::sync::broadcast;

use crate::error::AdsError;
use crate::model::value::PlcValue;
use crate::session::{Session, SessionBuilder, SessionEvent};
use crate::value::{ValueHandle, ValueOptions};

pub struct SessionBlocking {
    runtime: tokio::runtime::Runtime,
    session: Session,
}

impl SessionBlocking {
    /// Builds the session and dials the controller. Dial failures surface as
    /// session events, not as an `Err` here; only runtime setup can fail.
    pub fn open(builder: SessionBuilder) -> Result<Self, AdsError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .map_err(|err| AdsError::Runtime(err.to_string()))?;

        let session = builder.build();
        runtime.block_on(session.open());
        Ok(SessionBlocking { runtime, session })
    }

    pub fn inner(&self) -> &Session {
        &self.session
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.events()
    }

    pub fn value(&self, name: &str) -> ValueHandle {
        self.runtime.block_on(self.session.value(name))
    }

    pub fn value_with(&self, name: &str, options: ValueOptions) -> ValueHandle {
        self.runtime.block_on(self.session.value_with(name, options))
    }

    pub fn get(&self, name: &str) -> PlcValue {
        self.runtime.block_on(async {
            let value = self.session.value(name).await;
            value.get().await
        })
    }

    pub fn set(&self, name: &str, new_value: impl Into<PlcValue>) {
        let new_value = new_value.into();
        self.runtime.block_on(async {
            let value = self.session.value(name).await;
            value.set(new_value).await;
        })
    }

    pub fn disconnect(&self) {
        self.runtime.block_on(self.session.disconnect());
    }

    /// Runs an arbitrary future against the session's runtime, for the
    /// async-only surfaces such as [`ValueHandle::subscribe`].
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}
