//! Cross-cutting RPC plumbing: the uniform entry/exit/error log every
//! handler runs under, and the required-field checks proto3 cannot express.

use std::future::Future;
use std::time::Instant;

use tonic::{Response, Status};
use tracing::{debug, error, info};

/// Runs a handler with the standard request log around it: one line on the
/// way in with the request's idempotency key, one line on the way out with
/// the elapsed time, and an error line carrying the gRPC code on failure.
pub async fn logged<T, F>(method: &'static str, key: &str, handler: F) -> Result<Response<T>, Status>
where
    F: Future<Output = Result<Response<T>, Status>>,
{
    let start = Instant::now();
    if key.is_empty() {
        info!("=> GRPC {}", method);
    } else {
        info!("=> GRPC {} {}", method, key);
    }

    match handler.await {
        Ok(response) => {
            info!(
                "<= GRPC {} served in {:.3}s",
                method,
                start.elapsed().as_secs_f64()
            );
            Ok(response)
        }
        Err(status) => {
            error!(
                "!! GRPC {} failed in {:.3}s with {:?} ({})",
                method,
                start.elapsed().as_secs_f64(),
                status.code(),
                status.message()
            );
            Err(status)
        }
    }
}

/// Logs request parameters at debug level without flooding the info log.
pub fn log_request<R: std::fmt::Debug>(request: &R) {
    debug!(?request, "request parameters");
}

fn missing(field: &str) -> Status {
    Status::invalid_argument(format!("Missing required fields: {}", field))
}

/// Requires a non-empty string field.
pub fn required_str<'a>(value: &'a str, field: &'static str) -> Result<&'a str, Status> {
    if value.is_empty() {
        return Err(missing(field));
    }
    Ok(value)
}

/// Requires a present message field.
pub fn required_field<'a, T>(value: &'a Option<T>, field: &'static str) -> Result<&'a T, Status> {
    value.as_ref().ok_or_else(|| missing(field))
}

/// Requires a non-empty repeated field.
pub fn required_list<'a, T>(value: &'a [T], field: &'static str) -> Result<&'a [T], Status> {
    if value.is_empty() {
        return Err(missing(field));
    }
    Ok(value)
}
