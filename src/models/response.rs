//! JSON response envelope

use serde::{Deserialize, Serialize};

/// `{err_no, err_msg, data}` envelope returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resp<T> {
    pub err_no: i32,
    pub err_msg: String,
    pub data: Option<T>,
}

impl<T> Resp<T> {
    pub fn success(data: T) -> Self {
        Self {
            err_no: 0,
            err_msg: "success".to_string(),
            data: Some(data),
        }
    }

    pub fn failure(err: &dyn std::fmt::Display) -> Self {
        Self {
            err_no: -1,
            err_msg: err.to_string(),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.err_no == 0
    }
}

impl<T, E: std::fmt::Display> From<Result<T, E>> for Resp<T> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(e) => Self::failure(&e),
        }
    }
}
