//! UNIX socket support for tonic servers and clients. Socket support is
//! not built into tonic, and CSI plugins are almost always reached over a
//! socket shared with the kubelet, so we carry our own glue.

pub mod client;
pub mod server;
