pub mod copy;
pub mod prelude;
pub mod signal;
pub mod strng;
pub mod telemetry;
pub mod version;
