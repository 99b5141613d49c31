//! Runnable demos for the relcache workspace. See `examples/`.
