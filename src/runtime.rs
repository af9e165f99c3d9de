// runtime-async-std
#[cfg(all(feature = "runtime-async-std", not(feature = "runtime-tokio")))]
pub use async_std::task::yield_now;

// runtime-tokio
#[cfg(feature = "runtime-tokio")]
pub use tokio::task::yield_now;

#[cfg(not(any(feature = "runtime-tokio", feature = "runtime-async-std")))]
compile_error!("enable one of the `runtime-tokio` or `runtime-async-std` features");
