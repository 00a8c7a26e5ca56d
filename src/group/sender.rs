use crate::proto::SenderStateProto;
use crate::Error;

/// Width of the replay bitmap behind the highest index seen.
const REPLAY_WINDOW: u32 = 64;

/// Per-sender counters within one group epoch.
///
/// The owning sender only advances `next_index`. Receivers only track the
/// highest index seen plus a bitmap of the 64 indices below it; they never
/// touch a sender's own counter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupSenderKeyState {
    sender_id: String,
    next_index: u32,
    highest_seen: Option<u32>,
    /// Bit `n` set: index `highest_seen - n` was decrypted.
    seen_window: u64,
}

impl GroupSenderKeyState {
    pub fn new(sender_id: &str) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            next_index: 0,
            highest_seen: None,
            seen_window: 0,
        }
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    pub fn highest_seen(&self) -> Option<u32> {
        self.highest_seen
    }

    /// Reserves the index of the next outgoing message.
    pub(crate) fn advance(&mut self) -> Result<u32, Error> {
        let index = self.next_index;
        self.next_index = index
            .checked_add(1)
            .ok_or_else(|| Error::Protocol("sender index exhausted".to_string()))?;
        Ok(index)
    }

    /// Rejects indices already decrypted or too far behind the window.
    pub(crate) fn check_fresh(&self, index: u32) -> Result<(), Error> {
        let Some(highest) = self.highest_seen else {
            return Ok(());
        };
        if index > highest {
            return Ok(());
        }

        let behind = highest - index;
        if behind >= REPLAY_WINDOW || self.seen_window & (1u64 << behind) != 0 {
            return Err(Error::MessageKeyNotCached(index));
        }
        Ok(())
    }

    /// Records a successful decryption of `index`.
    pub(crate) fn mark_seen(&mut self, index: u32) {
        match self.highest_seen {
            Some(highest) if index <= highest => {
                let behind = highest - index;
                if behind < REPLAY_WINDOW {
                    self.seen_window |= 1u64 << behind;
                }
            }
            Some(highest) => {
                let shift = index - highest;
                self.seen_window = if shift >= REPLAY_WINDOW {
                    1
                } else {
                    (self.seen_window << shift) | 1
                };
                self.highest_seen = Some(index);
            }
            None => {
                self.seen_window = 1;
                self.highest_seen = Some(index);
            }
        }
    }

    pub(crate) fn to_proto(&self) -> SenderStateProto {
        SenderStateProto {
            sender_id: self.sender_id.clone(),
            next_index: self.next_index,
            highest_seen: self.highest_seen,
            seen_window: self.seen_window,
        }
    }

    pub(crate) fn from_proto(proto: &SenderStateProto) -> Self {
        Self {
            sender_id: proto.sender_id.clone(),
            next_index: proto.next_index,
            highest_seen: proto.highest_seen,
            seen_window: proto.seen_window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_indices_increase() {
        let mut state = GroupSenderKeyState::new("alice");
        assert_eq!(state.advance().unwrap(), 0);
        assert_eq!(state.advance().unwrap(), 1);
        assert_eq!(state.next_index(), 2);
        assert_eq!(state.highest_seen(), None);
    }

    #[test]
    fn test_replays_are_rejected() {
        let mut state = GroupSenderKeyState::new("alice");
        for index in [3, 1, 2] {
            state.check_fresh(index).unwrap();
            state.mark_seen(index);
        }

        assert_eq!(state.highest_seen(), Some(3));
        assert_eq!(state.check_fresh(2), Err(Error::MessageKeyNotCached(2)));
        assert_eq!(state.check_fresh(3), Err(Error::MessageKeyNotCached(3)));
        assert!(state.check_fresh(0).is_ok());
        assert!(state.check_fresh(4).is_ok());
        // Receivers never move the owner's counter.
        assert_eq!(state.next_index(), 0);
    }

    #[test]
    fn test_indices_behind_window_are_rejected() {
        let mut state = GroupSenderKeyState::new("alice");
        state.mark_seen(0);
        state.mark_seen(100);

        assert_eq!(state.check_fresh(36), Err(Error::MessageKeyNotCached(36)));
        assert!(state.check_fresh(37).is_ok());
        assert_eq!(state.check_fresh(100), Err(Error::MessageKeyNotCached(100)));
    }
}
