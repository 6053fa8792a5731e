//! Sliding receive window for duplicate message detection

/// Number of message ids tracked behind the highest one received
pub const WINDOW_SIZE: u32 = 32;

/// Highest received message id plus a bitmap of the ids just below it.
///
/// Bit `n` of the bitmap records id `max_received - n`. Ids older than the
/// window are reported as duplicates since they can no longer be checked.
/// Comparisons use wrapping arithmetic so counters may roll over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveWindow {
    max_received: u32,
    bitmap: u32,
    initialized: bool,
}

impl ReceiveWindow {
    /// Window that has seen nothing yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Window anchored at a counter value learned out of band
    pub fn synchronized_at(message_id: u32) -> Self {
        Self {
            max_received: message_id,
            bitmap: 1,
            initialized: true,
        }
    }

    /// Whether any id has been recorded
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Highest id recorded so far
    pub fn max_received(&self) -> Option<u32> {
        self.initialized.then_some(self.max_received)
    }

    /// Record `message_id`, returning whether it was already seen
    pub fn check_and_record(&mut self, message_id: u32) -> bool {
        if !self.initialized {
            *self = Self::synchronized_at(message_id);
            return false;
        }

        let diff = message_id.wrapping_sub(self.max_received) as i32;
        if diff > 0 {
            let shift = diff as u32;
            self.bitmap = if shift >= WINDOW_SIZE {
                0
            } else {
                self.bitmap << shift
            };
            self.bitmap |= 1;
            self.max_received = message_id;
            return false;
        }

        let behind = diff.unsigned_abs();
        if behind >= WINDOW_SIZE {
            return true;
        }
        let bit = 1u32 << behind;
        if self.bitmap & bit != 0 {
            true
        } else {
            self.bitmap |= bit;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_and_repeat() {
        let mut window = ReceiveWindow::new();
        assert!(!window.check_and_record(10));
        assert!(!window.check_and_record(11));
        assert!(window.check_and_record(11));
        assert!(window.check_and_record(10));
        assert_eq!(window.max_received(), Some(11));
    }

    #[test]
    fn test_out_of_order_within_window() {
        let mut window = ReceiveWindow::new();
        assert!(!window.check_and_record(100));
        assert!(!window.check_and_record(105));
        assert!(!window.check_and_record(102));
        assert!(window.check_and_record(102));
        assert!(!window.check_and_record(101));
    }

    #[test]
    fn test_too_old_is_duplicate() {
        let mut window = ReceiveWindow::new();
        window.check_and_record(100);
        window.check_and_record(100 + WINDOW_SIZE);
        assert!(window.check_and_record(100));
        assert!(!window.check_and_record(101));
    }

    #[test]
    fn test_large_jump_clears_history() {
        let mut window = ReceiveWindow::new();
        window.check_and_record(1);
        window.check_and_record(1000);
        assert!(window.check_and_record(1000));
        assert!(!window.check_and_record(999));
    }

    #[test]
    fn test_counter_wraparound() {
        let mut window = ReceiveWindow::synchronized_at(u32::MAX - 1);
        assert!(!window.check_and_record(u32::MAX));
        assert!(!window.check_and_record(0));
        assert!(!window.check_and_record(1));
        assert!(window.check_and_record(u32::MAX));
        assert_eq!(window.max_received(), Some(1));
    }
}
