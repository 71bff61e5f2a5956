//! Runtime-configurable interpreter limits.

/// Default capacity (in cells) of the operand stack.
pub const DEFAULT_OPERAND_STACK_SIZE: usize = 64 * 1024;
/// Default capacity (in entries) of the frame (call) stack.
pub const DEFAULT_FRAME_STACK_SIZE: usize = 64 * 1024;
/// Default capacity (in entries) of the label stack.
pub const DEFAULT_LABEL_STACK_SIZE: usize = 64 * 1024;

/// Configuration knobs recognized by the [`Engine`](crate::Engine).
///
/// # Note
///
/// The three stacks are independently sized. The source material this crate
/// is grounded on conflated the frame-stack and label-stack capacities
/// (reusing one limit to size both arrays); that was a copy-paste bug and is
/// not reproduced here — `frame_stack_size` and `label_stack_size` are
/// distinct fields.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Config {
    operand_stack_size: usize,
    frame_stack_size: usize,
    label_stack_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            operand_stack_size: DEFAULT_OPERAND_STACK_SIZE,
            frame_stack_size: DEFAULT_FRAME_STACK_SIZE,
            label_stack_size: DEFAULT_LABEL_STACK_SIZE,
        }
    }
}

impl Config {
    /// Creates a new [`Config`] using the default limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the capacity, in cells, of the operand stack.
    pub fn with_operand_stack_size(mut self, size: usize) -> Self {
        self.operand_stack_size = size;
        self
    }

    /// Sets the capacity, in entries, of the frame stack.
    pub fn with_frame_stack_size(mut self, size: usize) -> Self {
        self.frame_stack_size = size;
        self
    }

    /// Sets the capacity, in entries, of the label stack.
    pub fn with_label_stack_size(mut self, size: usize) -> Self {
        self.label_stack_size = size;
        self
    }

    /// Returns the configured operand stack capacity.
    pub fn operand_stack_size(&self) -> usize {
        self.operand_stack_size
    }

    /// Returns the configured frame stack capacity.
    pub fn frame_stack_size(&self) -> usize {
        self.frame_stack_size
    }

    /// Returns the configured label stack capacity.
    pub fn label_stack_size(&self) -> usize {
        self.label_stack_size
    }
}
