mod sanity_checker;

pub use self::sanity_checker::{verify_heap, VerificationError};
