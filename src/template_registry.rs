//! Block template registry: caches recent templates with their PoW state,
//! exposes them to miners under short random job ids, and owns the path back
//! upstream for completed blocks.

use crate::constants::JOB_DAA_RETENTION_MULTIPLIER;
use crate::errors::SubmitError;
use crate::pow::{self, BlockSubmitter, PowBackend, PowWork, SubmitOutcome};
use kaspa_consensus_core::header::Header;
use kaspa_hashes::Hash;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Fan-out payload for a freshly registered template.
#[derive(Debug, Clone)]
pub struct JobNotification {
    pub job_id: String,
    pub pre_pow_hash: Hash,
    pub timestamp: u64,
    pub header: Arc<Header>,
}

struct TemplateEntry {
    header: Arc<Header>,
    pow: Arc<dyn PowWork>,
    job_id: String,
}

#[derive(Default)]
struct RegistryInner {
    templates: HashMap<Hash, TemplateEntry>,
    template_order: VecDeque<Hash>,
    jobs: HashMap<String, Hash>,
    job_order: VecDeque<String>,
    // Outlives the template cache so old shares still resolve their reward
    // cycle after the template itself is gone.
    job_daa: HashMap<String, u64>,
    job_daa_order: VecDeque<String>,
    listeners: Vec<mpsc::UnboundedSender<JobNotification>>,
}

pub struct TemplateRegistry {
    inner: Mutex<RegistryInner>,
    pow_backend: Arc<dyn PowBackend>,
    submitter: Arc<dyn BlockSubmitter>,
    cache_size: usize,
}

impl TemplateRegistry {
    pub fn new(pow_backend: Arc<dyn PowBackend>, submitter: Arc<dyn BlockSubmitter>, cache_size: usize) -> Self {
        Self { inner: Mutex::new(RegistryInner::default()), pow_backend, submitter, cache_size: cache_size.max(1) }
    }

    /// Subscribe to job announcements.
    pub fn register(&self) -> mpsc::UnboundedReceiver<JobNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().listeners.push(tx);
        rx
    }

    /// Ingest one template header. Re-deliveries of a cached template are
    /// no-ops; otherwise the template gets a PoW handle and a fresh job id,
    /// the cache cap is enforced FIFO, and all listeners are notified.
    pub fn on_template(&self, header: Header) {
        let header_hash = pow::header_hash(&header);
        let pre_pow = pow::pre_pow_hash(&header);
        let pow_work = self.pow_backend.new_work(&header);
        let header = Arc::new(header);

        let mut inner = self.inner.lock();
        if inner.templates.contains_key(&header_hash) {
            debug!("template {} already cached, ignoring", header_hash);
            return;
        }

        let job_id = Self::fresh_job_id(&inner.jobs);
        inner.templates.insert(header_hash, TemplateEntry { header: Arc::clone(&header), pow: pow_work, job_id: job_id.clone() });
        inner.template_order.push_back(header_hash);
        inner.jobs.insert(job_id.clone(), header_hash);
        inner.job_order.push_back(job_id.clone());
        inner.job_daa.insert(job_id.clone(), header.daa_score);
        inner.job_daa_order.push_back(job_id.clone());

        while inner.template_order.len() > self.cache_size {
            if let Some(evicted) = inner.template_order.pop_front() {
                inner.templates.remove(&evicted);
            }
            if let Some(old_job) = inner.job_order.pop_front() {
                inner.jobs.remove(&old_job);
            }
        }
        let daa_cap = self.cache_size * JOB_DAA_RETENTION_MULTIPLIER;
        while inner.job_daa_order.len() > daa_cap {
            if let Some(old_job) = inner.job_daa_order.pop_front() {
                inner.job_daa.remove(&old_job);
            }
        }

        debug!("registered template {} as job {} (daa {})", header_hash, job_id, header.daa_score);

        let notification = JobNotification { job_id, pre_pow_hash: pre_pow, timestamp: header.timestamp, header };
        inner.listeners.retain(|tx| tx.send(notification.clone()).is_ok());
    }

    /// Draw a random 2-byte job id not currently mapped. Collisions just
    /// redraw; the id space is tiny compared to the cache.
    fn fresh_job_id(jobs: &HashMap<String, Hash>) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let candidate = format!("{:04x}", rng.gen::<u16>());
            if !jobs.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    pub fn hash_of_job(&self, job_id: &str) -> Option<Hash> {
        self.inner.lock().jobs.get(job_id).copied()
    }

    pub fn pow_of(&self, header_hash: &Hash) -> Option<Arc<dyn PowWork>> {
        self.inner.lock().templates.get(header_hash).map(|entry| Arc::clone(&entry.pow))
    }

    /// DAA score of a job, 0 when unknown.
    pub fn daa_score_of_job(&self, job_id: &str) -> u64 {
        self.inner.lock().job_daa.get(job_id).copied().unwrap_or(0)
    }

    /// Stamp the winning nonce into the cached template, finalize it and hand
    /// the block upstream.
    pub async fn submit(&self, miner_id: &str, address: &str, header_hash: Hash, nonce: u64) -> Result<SubmitOutcome, SubmitError> {
        let (header, job_id) = {
            let inner = self.inner.lock();
            match inner.templates.get(&header_hash) {
                Some(entry) => ((*entry.header).clone(), entry.job_id.clone()),
                None => return Err(SubmitError::Transport(format!("template {header_hash} no longer cached"))),
            }
        };

        let mut block_header = header;
        block_header.nonce = nonce;
        let block_hash = pow::header_hash(&block_header);
        info!("submitting block {} (job {}, worker {}.{}, nonce {:016x})", block_hash, job_id, address, miner_id, nonce);

        let outcome = self.submitter.submit_block(block_header).await?;
        match &outcome {
            SubmitOutcome::Accepted => info!("block {} accepted upstream", block_hash),
            SubmitOutcome::Rejected(reason) => warn!("block {} rejected upstream: {}", block_hash, reason),
        }
        Ok(outcome)
    }

    #[cfg(test)]
    pub fn cached_templates(&self) -> usize {
        self.inner.lock().templates.len()
    }

    #[cfg(test)]
    pub fn known_jobs(&self) -> usize {
        self.inner.lock().jobs.len()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::test_header;
    use super::*;
    use crate::pow::mock::{MockPowBackend, MockSubmitter};

    fn registry_with(cache_size: usize) -> (Arc<TemplateRegistry>, Arc<MockSubmitter>) {
        let submitter = Arc::new(MockSubmitter::accepting());
        let registry =
            Arc::new(TemplateRegistry::new(Arc::new(MockPowBackend::accepting()), submitter.clone() as Arc<dyn BlockSubmitter>, cache_size));
        (registry, submitter)
    }

    #[test]
    fn test_on_template_registers_job_and_daa() {
        let (registry, _) = registry_with(8);
        let mut rx = registry.register();

        let header = test_header(1);
        let expected_hash = pow::header_hash(&header);
        registry.on_template(header);

        let notification = rx.try_recv().unwrap();
        assert_eq!(notification.timestamp, 1_700_000_000_001);
        assert_eq!(registry.hash_of_job(&notification.job_id), Some(expected_hash));
        assert_eq!(registry.daa_score_of_job(&notification.job_id), 10_001);
        assert!(registry.pow_of(&expected_hash).is_some());
    }

    #[test]
    fn test_duplicate_template_is_noop() {
        let (registry, _) = registry_with(8);
        let mut rx = registry.register();
        registry.on_template(test_header(1));
        registry.on_template(test_header(1));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.cached_templates(), 1);
    }

    #[test]
    fn test_fifo_eviction_drops_oldest_template_and_job() {
        let (registry, _) = registry_with(2);
        let mut rx = registry.register();
        registry.on_template(test_header(1));
        registry.on_template(test_header(2));
        registry.on_template(test_header(3));

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        let third = rx.try_recv().unwrap();

        assert_eq!(registry.cached_templates(), 2);
        assert_eq!(registry.known_jobs(), 2);
        assert!(registry.hash_of_job(&first.job_id).is_none());
        assert!(registry.hash_of_job(&second.job_id).is_some());
        assert!(registry.hash_of_job(&third.job_id).is_some());

        // The DAA mapping outlives the evicted template.
        assert_eq!(registry.daa_score_of_job(&first.job_id), 10_001);
    }

    #[test]
    fn test_unknown_job_daa_score_is_zero() {
        let (registry, _) = registry_with(2);
        assert_eq!(registry.daa_score_of_job("beef"), 0);
    }

    #[test]
    fn test_submit_stamps_nonce_and_forwards() {
        let (registry, submitter) = registry_with(4);
        let mut rx = registry.register();
        registry.on_template(test_header(1));
        let notification = rx.try_recv().unwrap();
        let header_hash = registry.hash_of_job(&notification.job_id).unwrap();

        let outcome = tokio_test::block_on(registry.submit("rig1", "kaspa:qq0", header_hash, 0xdead_beef)).unwrap();
        assert_eq!(outcome, SubmitOutcome::Accepted);
        let submitted = submitter.submitted.lock();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].nonce, 0xdead_beef);
    }

    #[test]
    fn test_submit_unknown_template_fails() {
        let (registry, _) = registry_with(4);
        assert!(tokio_test::block_on(registry.submit("rig1", "kaspa:qq0", Hash::from_bytes([9u8; 32]), 1)).is_err());
    }
}
