//! Gateway session state owned by a shard.

/// Identity and progress of one gateway session.
///
/// Sessions outlive connections: a session established on one connection can
/// be resumed on the next as long as its identifier and last seen sequence
/// are retained. A shard clears its session only when the gateway declares it
/// non-resumable or a fresh identify is about to happen.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Session {
    /// Server-assigned session identifier.
    id: Option<Box<str>>,
    /// Highest dispatch sequence seen within the session.
    sequence: Option<u64>,
    /// Gateway URL to use when resuming this session.
    resume_gateway_url: Option<Box<str>>,
}

impl Session {
    /// Create an empty session with no identity.
    pub const fn new() -> Self {
        Self {
            id: None,
            sequence: None,
            resume_gateway_url: None,
        }
    }

    /// Create a session from persisted identity and sequence, as loaded from
    /// a session store.
    pub fn from_parts(id: Option<String>, sequence: Option<u64>) -> Self {
        Self {
            id: id.map(String::into_boxed_str),
            sequence,
            resume_gateway_url: None,
        }
    }

    /// Session identifier, if one has been assigned.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Highest dispatch sequence seen, if any dispatch has arrived.
    pub const fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    /// URL to reconnect to when resuming, if the gateway advertised one.
    pub fn resume_gateway_url(&self) -> Option<&str> {
        self.resume_gateway_url.as_deref()
    }

    /// Whether a resume can be attempted on the next connection.
    ///
    /// A session with an identity is resumable; without a recorded sequence
    /// the resume replays from zero.
    pub const fn is_resumable(&self) -> bool {
        self.id.is_some()
    }

    /// Record the identity of a freshly established session.
    pub fn set_id(&mut self, id: String) {
        self.id = Some(id.into_boxed_str());
    }

    /// Record the gateway's resume URL for this session.
    pub fn set_resume_gateway_url(&mut self, url: Option<String>) {
        self.resume_gateway_url = url.map(String::into_boxed_str);
    }

    /// Advance the sequence, keeping it monotonically non-decreasing.
    ///
    /// Returns whether the provided sequence was accepted. Stale sequences,
    /// those at or below the current one, are rejected so replayed or
    /// out-of-order dispatches can be dropped.
    pub fn advance(&mut self, sequence: u64) -> bool {
        match self.sequence {
            Some(current) if sequence <= current => false,
            _ => {
                self.sequence = Some(sequence);

                true
            }
        }
    }

    /// Discard the session's identity and progress.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::Session;
    use static_assertions::assert_impl_all;
    use std::fmt::Debug;

    assert_impl_all!(Session: Clone, Debug, Default, Eq, PartialEq, Send, Sync);

    #[test]
    fn sequence_is_monotonic() {
        let mut session = Session::new();

        assert!(session.advance(1));
        assert!(session.advance(2));
        assert!(!session.advance(2));
        assert!(!session.advance(1));
        assert!(session.advance(40));
        assert_eq!(Some(40), session.sequence());
    }

    #[test]
    fn resumable_with_an_id() {
        let mut session = Session::new();
        assert!(!session.is_resumable());

        session.set_id("abc".to_owned());
        assert!(session.is_resumable());
        assert_eq!(None, session.sequence());

        session.advance(1);
        assert!(session.is_resumable());

        session.reset();
        assert!(!session.is_resumable());
        assert_eq!(None, session.id());
        assert_eq!(None, session.sequence());
    }

    #[test]
    fn from_persisted_parts() {
        let session = Session::from_parts(Some("abc".to_owned()), Some(42));

        assert_eq!(Some("abc"), session.id());
        assert_eq!(Some(42), session.sequence());
        assert!(session.is_resumable());

        let mut session = session;
        assert!(!session.advance(42));
        assert!(session.advance(43));
    }
}
