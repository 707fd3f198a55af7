/// Accumulates mono samples into fixed-size capture blocks.
///
/// Platform callbacks deliver whatever buffer size the driver picked; this
/// turns that stream into blocks of exactly `block_size` samples. A trailing
/// partial block is never emitted.
pub struct BlockAssembler {
    buffer: Vec<f32>,
    block_size: usize,
}

impl BlockAssembler {
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(block_size),
            block_size,
        }
    }

    /// Feed samples and return any complete blocks.
    pub fn feed(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.buffer.extend_from_slice(samples);

        let mut blocks = Vec::new();
        while self.buffer.len() >= self.block_size {
            let rest = self.buffer.split_off(self.block_size);
            blocks.push(std::mem::replace(&mut self.buffer, rest));
        }

        blocks
    }

    /// Samples waiting for the next block.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial block.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
