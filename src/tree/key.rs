use std::cmp;

/// A user key or one of three sentinel keys strictly above every user key.
///
/// The lock-free tree anchors its top with all three infinity levels so that
/// a seek always finds a real ancestor and successor; the fine-grained tree's
/// permanent root carries `Inf2`. Sentinels never compare equal to a user
/// key, so the extremes of the key type remain ordinary members.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub(crate) enum Key<K> {
    Fin(K),
    Inf0,
    Inf1,
    Inf2,
}

impl<K: PartialEq> PartialEq<K> for Key<K> {
    fn eq(&self, rhs: &K) -> bool {
        match self {
            Key::Fin(k) => k == rhs,
            _ => false,
        }
    }
}

impl<K: Ord> Key<K> {
    pub(crate) fn cmp(&self, rhs: &K) -> cmp::Ordering {
        match self {
            Key::Fin(k) => k.cmp(rhs),
            _ => cmp::Ordering::Greater,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Key;

    #[test]
    fn sentinels_sit_above_every_user_key() {
        assert!(Key::Fin(i32::MAX) < Key::Inf0);
        assert!(Key::<i32>::Inf0 < Key::Inf1);
        assert!(Key::<i32>::Inf1 < Key::Inf2);
        assert_eq!(Key::Fin(7).cmp(&7), std::cmp::Ordering::Equal);
        assert_eq!(Key::<i32>::Inf0.cmp(&i32::MAX), std::cmp::Ordering::Greater);
        assert!(Key::Inf0 != i32::MAX);
    }
}
