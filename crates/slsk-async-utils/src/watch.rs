//! Only-on-change publication for [`postage::watch`] senders.
//!
//! Observable state in the daemon is a snapshot per watch channel, and
//! most recomputations produce a snapshot equal to the one already
//! published.  Writing those through anyway would wake every subscriber
//! for nothing, so publishers go through [`WatchSenderExt`], which
//! compares before it stores.

use postage::watch;

/// Extension methods for `postage::watch::Sender`.
pub trait WatchSenderExt<T> {
    /// Publish `next`, waking receivers, unless it equals the value
    /// already in the channel.
    ///
    /// Returns true if a publication happened.
    fn send_if_changed(&mut self, next: T) -> bool
    where
        T: PartialEq;

    /// Clone the current value, apply `edit` to the copy, and publish
    /// the result if it ended up different.
    ///
    /// Returns true if a publication happened.
    fn edit<F>(&mut self, edit: F) -> bool
    where
        T: Clone + PartialEq,
        F: FnOnce(&mut T);
}

impl<T> WatchSenderExt<T> for watch::Sender<T> {
    fn send_if_changed(&mut self, next: T) -> bool
    where
        T: PartialEq,
    {
        // The read guard must be gone before borrow_mut; holding &mut
        // self means nothing can race in between.
        let unchanged = next == *self.borrow();
        if unchanged {
            return false;
        }
        *self.borrow_mut() = next;
        true
    }

    fn edit<F>(&mut self, edit: F) -> bool
    where
        T: Clone + PartialEq,
        F: FnOnce(&mut T),
    {
        let mut next = self.borrow().clone();
        edit(&mut next);
        self.send_if_changed(next)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use futures::stream::StreamExt as _;

    #[tokio::test]
    async fn publishes_only_changes() {
        let (mut tx, mut rx) = postage::watch::channel_with(0_u32);
        assert_eq!(rx.next().await, Some(0));

        assert!(!tx.send_if_changed(0), "no wakeup for an equal value");
        assert!(tx.send_if_changed(7));
        assert_eq!(rx.next().await, Some(7));
    }

    #[tokio::test]
    async fn edit_compares_after_the_edit() {
        let (mut tx, mut rx) = postage::watch::channel_with(vec![1_u32]);
        assert_eq!(rx.next().await, Some(vec![1]));

        assert!(!tx.edit(|_| {}));
        assert!(tx.edit(|v| v.push(2)));
        assert_eq!(rx.next().await, Some(vec![1, 2]));
    }
}
