//! Link selection for outgoing frames
//!
//! Least-outstanding-bytes over healthy links. Selection charges the frame
//! size to the chosen link right away, so a burst of back-to-back selections
//! spreads over equally loaded links instead of piling onto one.

use super::{Link, LinkHealth, LinkId, TunnelError};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, trace};

/// The links of one session, in the order they were added
pub struct LinkSet {
    links: Vec<Arc<Link>>,
    changed: Arc<Notify>,
}

impl LinkSet {
    pub fn new() -> Self {
        Self {
            links: Vec::new(),
            changed: Arc::new(Notify::new()),
        }
    }

    /// Add a link to the rotation
    pub fn add(&mut self, link: Arc<Link>) {
        if self.links.iter().any(|l| l.id() == link.id()) {
            return;
        }
        info!(link = link.id(), name = %link.name(), "link added");
        self.links.push(link);
        self.changed.notify_waiters();
    }

    /// Pick the link for a frame of `size` bytes and charge it
    pub fn select_link(&self, stream_id: u32, size: usize) -> Result<Arc<Link>, TunnelError> {
        let link = self
            .links
            .iter()
            .filter(|l| l.is_healthy())
            // min_by_key keeps the first of equal elements
            .min_by_key(|l| l.outstanding())
            .ok_or(TunnelError::NoLinkAvailable)?;

        link.charge(size as u64);
        trace!(stream = stream_id, link = link.id(), size, "link selected");
        Ok(link.clone())
    }

    /// Mark a link dead and take it out of rotation
    pub fn report_failure(&mut self, id: LinkId) -> Option<Arc<Link>> {
        let pos = self.links.iter().position(|l| l.id() == id)?;
        let link = self.links.remove(pos);
        link.mark_dead();
        link.shutdown();
        debug!(link = id, name = %link.name(), remaining = self.links.len(), "link removed");
        self.changed.notify_waiters();
        Some(link)
    }

    /// A degraded link made progress again
    pub fn report_success(&self, id: LinkId) {
        if let Some(link) = self.get(id) {
            if link.recover() {
                info!(link = id, "link recovered");
                self.changed.notify_waiters();
            }
        }
    }

    /// Waiters are woken whenever a link is added, removed or recovers
    pub fn changed(&self) -> Arc<Notify> {
        self.changed.clone()
    }

    pub fn get(&self, id: LinkId) -> Option<&Arc<Link>> {
        self.links.iter().find(|l| l.id() == id)
    }

    pub fn links(&self) -> &[Arc<Link>] {
        &self.links
    }

    pub fn healthy_count(&self) -> usize {
        self.links
            .iter()
            .filter(|l| l.health() == LinkHealth::Healthy)
            .count()
    }

    /// Remove every link, returning them
    pub fn drain(&mut self) -> Vec<Arc<Link>> {
        let links = std::mem::take(&mut self.links);
        self.changed.notify_waiters();
        links
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

impl Default for LinkSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn link(id: LinkId) -> Arc<Link> {
        let (io, _peer) = tokio::io::duplex(1024);
        Link::spawn(id, format!("link-{}", id), io, Duration::from_secs(15)).0
    }

    #[tokio::test]
    async fn test_no_link_available() {
        let set = LinkSet::new();
        assert!(matches!(
            set.select_link(1, 10),
            Err(TunnelError::NoLinkAvailable)
        ));
    }

    #[tokio::test]
    async fn test_single_link_takes_everything() {
        let mut set = LinkSet::new();
        set.add(link(1));
        for _ in 0..10 {
            assert_eq!(set.select_link(1, 100).unwrap().id(), 1);
        }
    }

    #[tokio::test]
    async fn test_equal_links_alternate() {
        let mut set = LinkSet::new();
        set.add(link(1));
        set.add(link(2));

        let picks: Vec<_> = (0..6)
            .map(|_| set.select_link(1, 100).unwrap().id())
            .collect();
        assert_eq!(picks, vec![1, 2, 1, 2, 1, 2]);
    }

    #[tokio::test]
    async fn test_prefers_lighter_link() {
        let mut set = LinkSet::new();
        let heavy = link(1);
        heavy.charge(10_000);
        set.add(heavy);
        set.add(link(2));

        for _ in 0..5 {
            assert_eq!(set.select_link(3, 1000).unwrap().id(), 2);
        }
    }

    #[tokio::test]
    async fn test_failure_and_degradation() {
        let mut set = LinkSet::new();
        set.add(link(1));
        set.add(link(2));

        set.get(1).unwrap().note_stall();
        assert_eq!(set.healthy_count(), 1);
        assert_eq!(set.select_link(1, 10).unwrap().id(), 2);

        set.report_success(1);
        assert_eq!(set.healthy_count(), 2);

        let removed = set.report_failure(2).unwrap();
        assert_eq!(removed.health(), LinkHealth::Dead);
        assert_eq!(set.len(), 1);
        assert_eq!(set.select_link(1, 10).unwrap().id(), 1);

        set.report_failure(1);
        assert!(matches!(
            set.select_link(1, 10),
            Err(TunnelError::NoLinkAvailable)
        ));
    }
}
