//! Context module for metasched.
//!
//! This module provides the factory that turns method and model blocks of a
//! [`ProblemDescription`](crate::config::ProblemDescription) into iterators, either
//! lightweight (shape and processor information only) or fully instantiated.
//!
//! Modules:
//! - [`iterator_context`]: Contains the `IteratorFactory` and the `SubIteratorInfo` probe record.
//!
//! # Example
//! ```rust,ignore
//! use metasched::context::{Construction, IteratorFactory};
//! let factory = IteratorFactory::new(description);
//! let top = factory.build_method(&factory.description().top_method, Construction::Full)?;
//! ```

pub mod iterator_context;
pub use iterator_context::{Construction, IteratorFactory, SubIteratorInfo, MAX_NESTING_DEPTH};
