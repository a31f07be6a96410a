//! Lifetime tokens tying cached states to the transaction that produced them.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

#[derive(Debug)]
enum TokenState {
    Active,
    Expired,
    Promoted(LifetimeToken),
}

/// Validity marker shared by every state written under one transaction.
///
/// A token is expired when its transaction rolls back, and promoted to the
/// outer transaction's token when a nested transaction commits. Promoted
/// tokens follow the chain, so states written in a committed savepoint become
/// invalid when the enclosing transaction rolls back.
#[derive(Clone)]
pub struct LifetimeToken {
    inner: Arc<Mutex<TokenState>>,
}

impl fmt::Debug for LifetimeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifetimeToken")
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl Default for LifetimeToken {
    fn default() -> Self {
        Self::new()
    }
}

impl LifetimeToken {
    /// Creates an active token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TokenState::Active)),
        }
    }

    /// Returns true while neither this token nor any token it was promoted to
    /// has expired.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let mut current = self.clone();
        loop {
            let next = match &*current.inner.lock() {
                TokenState::Active => return true,
                TokenState::Expired => return false,
                TokenState::Promoted(next) => next.clone(),
            };
            current = next;
        }
    }

    /// Expires the token.
    pub fn expire(&self) {
        *self.inner.lock() = TokenState::Expired;
    }

    /// Delegates validity to `outer` from now on.
    pub fn promote_to(&self, outer: &LifetimeToken) {
        if Arc::ptr_eq(&self.inner, &outer.inner) {
            return;
        }
        *self.inner.lock() = TokenState::Promoted(outer.clone());
    }

    /// Returns true if both handles share one token.
    #[must_use]
    pub fn same_as(&self, other: &LifetimeToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expire_invalidates_clones() {
        let token = LifetimeToken::new();
        let copy = token.clone();
        assert!(copy.is_valid());
        token.expire();
        assert!(!copy.is_valid());
    }

    #[test]
    fn promoted_token_follows_outer() {
        let outer = LifetimeToken::new();
        let inner = LifetimeToken::new();
        inner.promote_to(&outer);
        assert!(inner.is_valid());
        outer.expire();
        assert!(!inner.is_valid());
    }

    #[test]
    fn promotion_chains() {
        let a = LifetimeToken::new();
        let b = LifetimeToken::new();
        let c = LifetimeToken::new();
        c.promote_to(&b);
        b.promote_to(&a);
        assert!(c.is_valid());
        a.expire();
        assert!(!c.is_valid());
        c.promote_to(&c);
        assert!(!c.same_as(&a));
    }
}
