use thiserror::Error;

/// Error kinds by origin. Raised through [`anyhow`] so call sites can attach
/// context; match on the kind with `err.downcast_ref::<Error>()`.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum Error {
    /// Unknown source schema at engine init, or no lens path to the target
    /// schema.
    #[error("construction: {0}")]
    Construction(String),
    /// Registering a duplicate `to` schema, an unknown `from` schema, or a
    /// lens that doesn't fit the schema it is registered against.
    #[error("lens registration: {0}")]
    LensRegistration(String),
    /// A requested path's parent is absent while translating a non-list op.
    #[error("path resolution: {0}")]
    PathResolution(String),
    /// A malformed patch value, a missing reifier for an insertion
    /// placeholder, or an otherwise inconsistent op.
    #[error("op shape: {0}")]
    OpShape(String),
}
