// -
// Namespace layout

/// Root of the store namespace
pub const ROOT_PATH: &str = "/";

/// Width of the numeric suffix appended to sequential nodes
pub(crate) const SEQUENCE_SUFFIX_WIDTH: usize = 10;

/// Prefix marking a protected node name: `_c_<id>-<name>`
pub(crate) const PROTECTED_PREFIX: &str = "_c_";

/// Length of the generated id inside a protected node name
pub(crate) const PROTECTED_ID_LEN: usize = 21;

// -
// Cache defaults

/// Unbounded subtree depth, same ceiling as a signed 32-bit depth
pub const DEFAULT_MAX_DEPTH: u32 = i32::MAX as u32;
