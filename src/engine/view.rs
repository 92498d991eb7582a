//! Typed read-only access to other components.

use crate::engine::component::{Component, Named};
use crate::engine::error::ViewError;

/// What one component may read of the others.
///
/// Reads are limited to the components the reader declared in
/// [`Component::depends_on`], and only once they are finalized.
#[derive(Clone, Copy)]
pub struct View<'a> {
    requester: &'static str,
    declared: &'static [&'static str],
    finalized: &'a [Box<dyn Component>],
    pending: &'a [&'static str],
}

impl<'a> View<'a> {
    pub(crate) fn new(
        requester: &'static str,
        declared: &'static [&'static str],
        finalized: &'a [Box<dyn Component>],
        pending: &'a [&'static str],
    ) -> Self {
        View {
            requester,
            declared,
            finalized,
            pending,
        }
    }

    /// Name of the component holding this view.
    pub fn requester(&self) -> &'static str {
        self.requester
    }

    /// Borrow the finalized state of component `T`.
    pub fn get<T: Component + Named>(&self) -> Result<&'a T, ViewError> {
        let target = T::NAME;
        if !self.declared.contains(&target) {
            return Err(ViewError::Undeclared {
                requester: self.requester,
                target,
            });
        }

        let Some(found) = self.finalized.iter().find(|c| c.name() == target) else {
            return Err(if self.pending.contains(&target) {
                ViewError::NotHydrated {
                    requester: self.requester,
                    target,
                }
            } else {
                ViewError::Unavailable {
                    requester: self.requester,
                    target,
                }
            });
        };

        found
            .as_ref()
            .as_any()
            .downcast_ref::<T>()
            .ok_or(ViewError::TypeMismatch { target })
    }
}
