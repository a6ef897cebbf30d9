//! Helpers shared by the integration tests.

#![allow(dead_code)]

use stagehand::{Bridge, CallResult, Error, HandlerRegistry, IoContext, StagehandConfig};

/// Start a context with every built-in handler.
pub fn start(config: StagehandConfig) -> (IoContext, Bridge) {
    IoContext::spawn(config, HandlerRegistry::default()).expect("failed to start I/O context")
}

pub fn start_default() -> (IoContext, Bridge) {
    start(StagehandConfig::default())
}

/// Unwrap a call expected to succeed.
pub fn ok<T>(result: CallResult<T>) -> T {
    match result {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => panic!("call failed: {}", err),
        Err(err) => panic!("fatal error: {}", err),
    }
}

/// Unwrap a call expected to fail with a semantic error.
pub fn err<T: std::fmt::Debug>(result: CallResult<T>) -> Error {
    match result {
        Ok(Ok(value)) => panic!("call unexpectedly succeeded with {:?}", value),
        Ok(Err(err)) => err,
        Err(err) => panic!("fatal error: {}", err),
    }
}
