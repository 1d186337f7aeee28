//! Ownership of inlined payload buffers.
//!
//! Inlined operations hand their payload to the device, which must
//! release it exactly once, at completion-post time. The buffer travels
//! through the `local_addr` field as a slab token rather than an address.

pub(crate) struct InlineSlab {
    slots: spin::Mutex<Vec<Option<Vec<u8>>>>,
}

impl InlineSlab {
    pub fn new() -> Self {
        Self {
            slots: spin::Mutex::new(Vec::new()),
        }
    }

    /// Store a payload, returning its token.
    pub fn insert(&self, buf: Vec<u8>) -> u64 {
        let mut slots = self.slots.lock();
        if let Some(idx) = slots.iter().position(|s| s.is_none()) {
            slots[idx] = Some(buf);
            idx as u64
        } else {
            slots.push(Some(buf));
            (slots.len() - 1) as u64
        }
    }

    /// Take a payload out, releasing the token.
    pub fn take(&self, token: u64) -> Option<Vec<u8>> {
        self.slots.lock().get_mut(token as usize)?.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_releases_exactly_once() {
        let slab = InlineSlab::new();
        let t = slab.insert(vec![1, 2, 3]);
        assert_eq!(slab.take(t), Some(vec![1, 2, 3]));
        assert_eq!(slab.take(t), None);
    }

    #[test]
    fn test_tokens_are_reused() {
        let slab = InlineSlab::new();
        let a = slab.insert(vec![1]);
        slab.take(a);
        let b = slab.insert(vec![2]);
        assert_eq!(a, b);
    }
}
