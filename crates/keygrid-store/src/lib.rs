//! keygrid-store — one table contract, two interchangeable backends.
//!
//! Application code talks to a [`Table`], which resolves key maps into
//! calls on a [`TableStorage`] backend: [`DynamoStorage`] against the
//! managed store, or [`MemoryStorage`], an in-process emulation with the
//! same query, ordering, filtering, and pagination semantics.
//!
//! # Architecture
//!
//! ```text
//! caller
//!   └── Table (key resolution, validation)
//!         ├── TableStorage::query / get_item / update / ...
//!         │     ├── DynamoStorage  (wire encode/decode, retries)
//!         │     └── MemoryStorage  (in-process filter/sort/slice)
//!         └── ResultPage ──→ QueryIterator (multi-page drains)
//! ```
//!
//! Backends are selected once at startup via [`factory::storage_from_env`]
//! and shared as `Arc<dyn TableStorage>` across tasks.

pub mod dynamo;
pub mod factory;
pub mod memory;
pub mod paging;
pub mod storage;
pub mod table;

pub use dynamo::DynamoStorage;
pub use factory::storage_from_env;
pub use memory::MemoryStorage;
pub use paging::QueryIterator;
pub use storage::{QueryOptions, ResultPage, TableStorage, decode_page_token, encode_page_token};
pub use table::{GetManyOptions, Index, Table};
