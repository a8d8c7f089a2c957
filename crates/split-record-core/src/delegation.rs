//! Forwarding of unrecognised members to named collaborators.
//!
//! A host declares one or more delegations, each an ordered list of
//! collaborator accessors. When the host cannot answer a [`Selector`] itself it
//! hands the chain to [`DelegationChain::dispatch`], which walks the
//! declarations newest-first and, inside one declaration, the collaborators in
//! the order they were given. The first collaborator that responds receives
//! the call. The chain has no knowledge of records; it only composes objects
//! that implement [`Dynamic`].

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use crate::error::MtiError;
use crate::value::FieldValue;

/// A member request: read, write or presence-test a named field, or call a
/// named method.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Selector {
    Read(String),
    Write(String),
    Presence(String),
    Call(String),
}

impl Selector {
    #[must_use]
    pub fn read(name: impl Into<String>) -> Self {
        Self::Read(name.into())
    }

    #[must_use]
    pub fn write(name: impl Into<String>) -> Self {
        Self::Write(name.into())
    }

    #[must_use]
    pub fn presence(name: impl Into<String>) -> Self {
        Self::Presence(name.into())
    }

    #[must_use]
    pub fn call(name: impl Into<String>) -> Self {
        Self::Call(name.into())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Read(name) | Self::Write(name) | Self::Presence(name) | Self::Call(name) => name,
        }
    }

    /// Fixed argument count, or `None` for method calls.
    #[must_use]
    pub fn arity(&self) -> Option<usize> {
        match self {
            Self::Read(_) | Self::Presence(_) => Some(0),
            Self::Write(_) => Some(1),
            Self::Call(_) => None,
        }
    }

    /// Reject argument lists that do not match [`Selector::arity`].
    ///
    /// # Errors
    /// Returns `MtiError::Arity` on mismatch.
    pub fn check_arity(&self, given: usize) -> Result<(), MtiError> {
        match self.arity() {
            Some(expected) if expected != given => Err(MtiError::Arity {
                selector: self.clone(),
                expected,
                given,
            }),
            _ => Ok(()),
        }
    }
}

impl Display for Selector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read(name) => write!(f, "read `{name}`"),
            Self::Write(name) => write!(f, "write `{name}`"),
            Self::Presence(name) => write!(f, "presence `{name}`"),
            Self::Call(name) => write!(f, "call `{name}`"),
        }
    }
}

/// Object whose members are resolved at runtime.
///
/// `respond_to` must agree with `send`: a `true` answer means `send` with the
/// same selector will not fail with `MtiError::MethodNotFound`.
pub trait Dynamic<C: ?Sized> {
    fn type_name(&self) -> &str;

    /// Check for `selector` without performing it.
    ///
    /// # Errors
    /// Returns an error when evaluating a collaborator accessor fails.
    fn respond_to(&mut self, cx: &mut C, selector: &Selector) -> Result<bool, MtiError>;

    /// Perform `selector` with `args`.
    ///
    /// # Errors
    /// Returns `MtiError::MethodNotFound` when nothing handles the selector, or
    /// whatever error the handling member produced.
    fn send(
        &mut self,
        cx: &mut C,
        selector: &Selector,
        args: Vec<FieldValue>,
    ) -> Result<FieldValue, MtiError>;
}

/// Evaluates a named collaborator of the host. `None` means the collaborator
/// is currently absent, which counts as "does not respond".
pub type Accessor<H, C> = Arc<
    dyn for<'h> Fn(&'h mut H, &mut C) -> Result<Option<&'h mut dyn Dynamic<C>>, MtiError>
        + Send
        + Sync,
>;

/// Wrap a closure as an [`Accessor`].
pub fn accessor<H, C, F>(f: F) -> Accessor<H, C>
where
    H: 'static,
    C: ?Sized + 'static,
    F: for<'h> Fn(&'h mut H, &mut C) -> Result<Option<&'h mut dyn Dynamic<C>>, MtiError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

struct Collaborator<H, C: ?Sized> {
    name: String,
    accessor: Accessor<H, C>,
}

impl<H, C: ?Sized> Clone for Collaborator<H, C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            accessor: Arc::clone(&self.accessor),
        }
    }
}

/// Ordered fallback declarations of one host type.
pub struct DelegationChain<H, C: ?Sized> {
    declarations: Vec<Vec<Collaborator<H, C>>>,
}

impl<H, C: ?Sized> Default for DelegationChain<H, C> {
    fn default() -> Self {
        Self {
            declarations: Vec::new(),
        }
    }
}

impl<H, C: ?Sized> Clone for DelegationChain<H, C> {
    fn clone(&self) -> Self {
        Self {
            declarations: self.declarations.clone(),
        }
    }
}

impl<H, C: ?Sized> std::fmt::Debug for DelegationChain<H, C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegationChain")
            .field("order", &self.collaborator_names())
            .finish()
    }
}

impl<H, C: ?Sized> DelegationChain<H, C> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one declaration. Earlier declarations stay in place and are
    /// consulted after this one.
    pub fn delegate_missing_to<I, N>(&mut self, collaborators: I)
    where
        I: IntoIterator<Item = (N, Accessor<H, C>)>,
        N: Into<String>,
    {
        let declaration = collaborators
            .into_iter()
            .map(|(name, accessor)| Collaborator {
                name: name.into(),
                accessor,
            })
            .collect::<Vec<_>>();
        if !declaration.is_empty() {
            self.declarations.push(declaration);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }

    /// Collaborator names in the order they are consulted.
    #[must_use]
    pub fn collaborator_names(&self) -> Vec<&str> {
        self.ordered()
            .map(|collaborator| collaborator.name.as_str())
            .collect()
    }

    fn ordered(&self) -> impl Iterator<Item = &Collaborator<H, C>> {
        self.declarations
            .iter()
            .rev()
            .flat_map(|declaration| declaration.iter())
    }

    /// Whether any collaborator responds to `selector`.
    ///
    /// # Errors
    /// Propagates accessor and `respond_to` failures.
    pub fn responds_to(
        &self,
        host: &mut H,
        cx: &mut C,
        selector: &Selector,
    ) -> Result<bool, MtiError> {
        for collaborator in self.ordered() {
            if let Some(target) = (collaborator.accessor)(&mut *host, &mut *cx)? {
                if target.respond_to(cx, selector)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Forward `selector` to the first responding collaborator.
    ///
    /// # Errors
    /// Returns `MtiError::MethodNotFound` naming the selector and the host
    /// type when no collaborator responds.
    pub fn dispatch(
        &self,
        host: &mut H,
        cx: &mut C,
        selector: &Selector,
        args: Vec<FieldValue>,
    ) -> Result<FieldValue, MtiError>
    where
        H: Dynamic<C>,
    {
        for collaborator in self.ordered() {
            if let Some(target) = (collaborator.accessor)(&mut *host, &mut *cx)? {
                if target.respond_to(cx, selector)? {
                    tracing::trace!(
                        collaborator = %collaborator.name,
                        target = target.type_name(),
                        %selector,
                        "forwarding missing member"
                    );
                    return target.send(cx, selector, args);
                }
            }
        }

        Err(MtiError::MethodNotFound {
            selector: selector.clone(),
            receiver: host.type_name().to_string(),
        })
    }
}
