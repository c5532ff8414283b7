pub mod adder;
pub mod enumerator;
pub mod export;
pub mod gateway;
pub mod governor;
pub mod log_buffer;
pub mod progress;
pub mod recent;
pub mod run;
pub mod session;
pub mod stats;
pub mod stop;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
