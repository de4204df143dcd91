pub const KB: usize = 1024;
pub const MB: usize = KB * KB;
pub const GB: usize = MB * KB;
pub const SECTOR_SIZE: u32 = 512;
pub const SWAP_SECTORS: u32 = 8192;

// Number of frames handed to the user pool when no explicit size is given.
pub const USER_POOL_FRAMES: usize = 1024;
