//! Boundary status codes
//!
//! Maps operation results onto the integer codes a host expects:
//! `0` for success and a negative value per failure kind.

/// Errors that have a stable boundary status code
pub trait StatusCode {
    fn status_code(&self) -> i32;
}

/// Status code of a whole operation result
pub fn status_of<T, E: StatusCode>(result: &Result<T, E>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.status_code(),
    }
}
