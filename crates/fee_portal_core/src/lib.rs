pub mod domain;
pub mod live;
pub mod payment;
pub mod ports;
pub mod roster;

pub use domain::{
    AuthSession, NewTransaction, Principal, Student, StudentPatch, Transaction,
    TransactionStatus, UserCredentials,
};
pub use live::{
    reduce, ChangeEvent, Keyed, LiveRecord, LiveView, LoadState, Owned, RowSource, Scope,
    StudentRows, Subscription,
};
pub use payment::{PaymentForm, PaymentValidationError};
pub use ports::{ChangeFeedService, DatabaseService, PortError, PortResult};
pub use roster::{project, RosterStats, StatusFilter};
