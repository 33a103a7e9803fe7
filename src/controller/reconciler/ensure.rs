//! # Ensure and Teardown
//!
//! Describe-or-create semantics shared by every sub-resource kind.
//!
//! `ensure` looks the object up by its deterministic name: absent objects are created,
//! present ones are updated with only the attributes that differ. Teardown deletes by
//! name and by ownership tag, and treats "not found" as success.

use crate::model::SubResource;
use crate::provider::{ProviderError, ResourceService};
use tracing::debug;

/// Result of one ensure call
#[derive(Debug, Clone, PartialEq)]
pub enum Ensured<O> {
    Created(O),
    Updated(O),
    Unchanged(O),
}

impl<O> Ensured<O> {
    pub fn into_inner(self) -> O {
        match self {
            Ensured::Created(o) | Ensured::Updated(o) | Ensured::Unchanged(o) => o,
        }
    }

    pub fn observed(&self) -> &O {
        match self {
            Ensured::Created(o) | Ensured::Updated(o) | Ensured::Unchanged(o) => o,
        }
    }
}

/// Converge one external object toward `desired`
///
/// A difference the provider cannot apply in place comes back as
/// [`ProviderError::Invalid`].
pub async fn ensure<R: SubResource>(
    service: &dyn ResourceService<R>,
    desired: &R::Desired,
) -> Result<Ensured<R::Observed>, ProviderError> {
    let name = R::name(desired);
    match service.describe(name).await {
        Ok(observed) => {
            if let Some(conflict) = R::conflict(desired, &observed) {
                return Err(ProviderError::Invalid(conflict));
            }
            match R::diff(desired, &observed) {
                Some(diff) => {
                    debug!(kind = R::KIND.as_str(), name, ?diff, "Updating drifted attributes");
                    Ok(Ensured::Updated(service.update(name, &diff).await?))
                }
                None => Ok(Ensured::Unchanged(observed)),
            }
        }
        Err(e) if e.is_not_found() && R::externally_owned(desired) => {
            Err(ProviderError::Invalid(format!(
                "{} {} is not managed by this controller and does not exist",
                R::KIND,
                name
            )))
        }
        Err(e) if e.is_not_found() => {
            debug!(kind = R::KIND.as_str(), name, "Creating");
            Ok(Ensured::Created(service.create(desired).await?))
        }
        Err(e) => Err(e),
    }
}

/// Delete by name; returns whether something was deleted
pub async fn delete_if_present<R: SubResource>(
    service: &dyn ResourceService<R>,
    name: &str,
) -> Result<bool, ProviderError> {
    match service.delete(name).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => {
            debug!(kind = R::KIND.as_str(), name, "Already absent");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Describe, and delete only when present
///
/// Used on every pass for objects the spec no longer asks for, so a steady state
/// issues no delete calls.
pub async fn ensure_absent<R: SubResource>(
    service: &dyn ResourceService<R>,
    name: &str,
) -> Result<bool, ProviderError> {
    match service.describe(name).await {
        Ok(_) => delete_if_present(service, name).await,
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Delete every object tagged as owned plus the `known` names
///
/// Stops at the first failure. Returns the names that were actually deleted.
pub async fn teardown<R: SubResource>(
    service: &dyn ResourceService<R>,
    owner_tag_key: &str,
    known: &[String],
) -> Result<Vec<String>, (String, ProviderError)> {
    let mut names = service
        .list_owned(owner_tag_key)
        .await
        .map_err(|e| (owner_tag_key.to_string(), e))?;
    names.extend(known.iter().cloned());
    names.sort();
    names.dedup();

    let mut deleted = Vec::new();
    for name in names {
        match delete_if_present(service, &name).await {
            Ok(true) => deleted.push(name),
            Ok(false) => {}
            Err(e) => return Err((name, e)),
        }
    }
    Ok(deleted)
}

/// Names among `known` and the owned objects that still describe as present
pub async fn still_present<R: SubResource>(
    service: &dyn ResourceService<R>,
    owner_tag_key: &str,
    known: &[String],
) -> Result<Vec<String>, ProviderError> {
    let mut present = service.list_owned(owner_tag_key).await?;
    for name in known {
        match service.describe(name).await {
            Ok(_) => present.push(name.clone()),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    present.sort();
    present.dedup();
    Ok(present)
}
