/// Fixed-rate frame gate. Bounds how often the detection model runs
/// independently of the capture frame rate.
#[derive(Debug, Clone)]
pub struct FrameSampler {
    skip_rate: u32,
    frames_seen: u64,
}

impl FrameSampler {
    /// A skip rate of 0 is treated as 1 (analyze everything).
    pub fn new(skip_rate: u32) -> Self {
        Self {
            skip_rate: skip_rate.max(1),
            frames_seen: 0,
        }
    }

    /// Stateless form of the gate
    pub fn should_analyze(index: u64, skip_rate: u32) -> bool {
        index % u64::from(skip_rate.max(1)) == 0
    }

    /// Count one decoded frame and report whether it should be analyzed.
    /// Frame indices start at 1, so with a skip rate of 3 the 3rd, 6th, ...
    /// frames pass.
    pub fn next_frame(&mut self) -> bool {
        self.frames_seen += 1;
        Self::should_analyze(self.frames_seen, self.skip_rate)
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    pub fn skip_rate(&self) -> u32 {
        self.skip_rate
    }

    pub fn reset(&mut self) {
        self.frames_seen = 0;
    }
}
