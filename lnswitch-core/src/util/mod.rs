/// Coarse operational error status
pub mod status;
/// Helpers shared by the test suites
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use status::Status;
