//! Cache key derivation
//!
//! Read-through keys are built from an explicit loader tag plus the
//! `serde_json` form of the loader argument: `{tag}:{json}`. A tag may not
//! contain `:`, so the first `:` always separates the two halves and distinct
//! `(tag, argument)` pairs never collide.
//!
//! Model keys used by the service variants are `{TypeName}_{id}`.

use serde::Serialize;

use crate::CacheError;

const TAG_SEPARATOR: char = ':';

/// Types that can be cached under their own identity
pub trait Identified {
    /// Stable identifier of this value, used to build its model key
    fn cache_id(&self) -> String;
}

/// Derive the cache key for `argument` loaded by the operation named `tag`
pub fn derive_key<A>(tag: &str, argument: &A) -> Result<String, CacheError>
where
    A: Serialize + ?Sized,
{
    validate_tag(tag)?;
    let serialized = serde_json::to_string(argument)?;
    Ok(format!("{tag}{TAG_SEPARATOR}{serialized}"))
}

/// Check a loader tag without deriving a key
pub fn validate_tag(tag: &str) -> Result<(), CacheError> {
    let malformed = tag.is_empty()
        || tag
            .chars()
            .any(|c| c == TAG_SEPARATOR || c.is_whitespace() || c.is_control());
    if malformed {
        return Err(CacheError::InvalidTag(tag.to_owned()));
    }
    Ok(())
}

/// Key for a value of type `V` identified by `id`
pub fn model_key<V: ?Sized>(id: &str) -> String {
    format!("{}_{}", short_type_name::<V>(), id)
}

/// Unqualified name of `V`, without module path or generic arguments
///
/// `my_app::models::User` becomes `User`, `Vec<my_app::User>` becomes `Vec`.
pub fn short_type_name<V: ?Sized>() -> &'static str {
    let full = std::any::type_name::<V>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
