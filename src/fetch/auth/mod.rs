mod headers;

pub use headers::AuthHeaders;
