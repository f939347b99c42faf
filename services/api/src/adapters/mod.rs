pub mod change_feed;
pub mod db;
pub mod memory;

pub use change_feed::{ChangeHub, PgChangeRelay};
pub use db::DbAdapter;
pub use memory::InMemoryDb;
