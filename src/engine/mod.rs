pub mod fetch;
pub mod persistence;
pub mod query;
pub mod store;
pub mod transform;
pub mod vault;

pub use fetch::FetchOptions;
pub use persistence::{ReadMode, WriteOptions};
pub use query::{Filter, Operation, Query, QuerySpec};
pub use store::{AppendOptions, Arkivist, Options, Scope};
pub use vault::Cipher;
