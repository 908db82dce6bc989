/// Symbol metadata, type mapping and addressing.
pub mod symbol;
/// Decoded values and conversion rules.
pub mod value;
