pub mod backend_http;
pub mod lookup_http;
