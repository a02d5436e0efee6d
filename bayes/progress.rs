/// Observer for reporting progress while chains run.
///
/// Chains of one model and the models themselves run on worker threads, so
/// every method takes `&self` and the observer must be `Sync`.
pub trait SamplingProgressObserver: Sync {
    fn on_chain_start(&self, model: &str, chain: usize, total_iterations: usize) {
        let _ = (model, chain, total_iterations);
    }
    fn on_chain_finish(&self, model: &str, chain: usize) {
        let _ = (model, chain);
    }
}

#[derive(Default)]
pub struct NoopSamplingProgress;

impl SamplingProgressObserver for NoopSamplingProgress {}
