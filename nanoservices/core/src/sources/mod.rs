pub mod http_client;
pub mod link_header;
pub mod rate_limit;
pub mod traits;

pub use http_client::{HttpClient, HttpFetcher};
pub use rate_limit::{Pacer, RequestSpacing, TokioPacer};
pub use traits::{Continuation, Request, Response, Source, SourceContext, Stream, StreamContext};
