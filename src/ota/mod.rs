// OTA (Over-The-Air) update module

pub mod manager;
pub mod partition;

pub use manager::{UpdateInfo, UpdateManager, UpdateStatus};
pub use partition::PartitionWriter;

// Update flow:
// 1. start() spawns the download worker
// 2. Transport resolves redirects and streams the image
// 3. Chunks are written to the next inactive partition bank
// 4. Finalize validates the image, then the bank is marked bootable
// 5. reboot() applies the update; the new image must mark_valid() or the
//    bootloader rolls back
