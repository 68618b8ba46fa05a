// Adapted from https://github.com/hyperium/tonic/blob/f1275b611e38ec5fe992b2f10552bf95e8448b17/examples/src/uds/client.rs

use std::path::Path;

use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

/// Returns a UNIX socket channel suitable for tonic generated gRPC
/// clients. Instead of `YourClient::connect`, pass the returned channel to
/// `YourClient::new`.
pub async fn socket_channel<P: AsRef<Path>>(path: P) -> Result<Channel, tonic::transport::Error> {
    let p = path.as_ref().to_owned();

    // The endpoint URI is a placeholder; the connector below ignores it.
    Endpoint::from_static("http://[::]:50051")
        .connect_with_connector(service_fn(move |_: Uri| UnixStream::connect(p.clone())))
        .await
}
