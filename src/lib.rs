pub mod agent;
pub mod config;
pub mod conversation;
pub mod db;
pub mod error;
pub mod export;
pub mod guard;
pub mod llm;
pub mod load;

pub use error::{ErrorKind, GuardError, GuardFailure, StoreError};
pub use guard::{Guard, GuardPolicy, GuardedResult, GuardedStatement};
