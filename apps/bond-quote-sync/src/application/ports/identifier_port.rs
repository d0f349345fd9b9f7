//! Identifier Resolver Port (Driven Port)
//!
//! Maps CUSIP and ISIN identifiers to the FIGI the market-data service
//! keys its streams by.

use crate::domain::instrument::{Figi, Identifier};

/// Port for identifier → FIGI resolution.
pub trait IdentifierResolver: Send + Sync {
    /// FIGI for an identifier, or `None` if unknown.
    ///
    /// FIGI identifiers resolve to themselves.
    fn resolve(&self, identifier: &Identifier) -> Option<Figi>;
}

/// Resolver that only understands FIGI identifiers.
#[derive(Debug, Clone, Copy, Default)]
pub struct FigiOnlyResolver;

impl IdentifierResolver for FigiOnlyResolver {
    fn resolve(&self, identifier: &Identifier) -> Option<Figi> {
        identifier.as_figi()
    }
}
