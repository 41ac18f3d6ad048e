//! Published channel names.
//!
//! Drivers that register FIFOs publish friendly aliases for them (`ulpt0`, `uhid1.2`, ...). The
//! static control node lists them with [`SymlinkRegistry::read_dir`] in a packed record format:
//!
//! ```text
//! [u8 total_len][src bytes][0][dst bytes][0] ... [0]
//! ```

use std::sync::Mutex;

use crate::error::Result;
use crate::uio::Uio;

/// Longest alias name kept; longer names are truncated.
pub const SYMLINK_NAME_MAX: usize = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AliasId(u64);

#[derive(Debug)]
struct Alias {
    id: AliasId,
    src: String,
    dst: String,
}

#[derive(Debug, Default)]
struct AliasList {
    next_id: u64,
    entries: Vec<Alias>,
}

#[derive(Debug, Default)]
pub struct SymlinkRegistry {
    inner: Mutex<AliasList>,
}

pub(crate) fn truncate_name(name: &str) -> String {
    let mut end = name.len().min(SYMLINK_NAME_MAX);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_owned()
}

impl SymlinkRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, AliasList> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publishes `target` under its own name.
    pub fn alloc(&self, target: &str) -> AliasId {
        let name = truncate_name(target);
        let mut list = self.lock();
        list.next_id += 1;
        let id = AliasId(list.next_id);
        list.entries.push(Alias {
            id,
            src: name.clone(),
            dst: name,
        });
        id
    }

    pub fn free(&self, id: AliasId) {
        self.lock().entries.retain(|alias| alias.id != id);
    }

    /// Published names in publication order.
    pub fn names(&self) -> Vec<String> {
        self.lock()
            .entries
            .iter()
            .map(|alias| alias.src.clone())
            .collect()
    }

    /// Encodes the alias list into `uio`, skipping the first `start_entry` records.
    ///
    /// Records that do not fit the remaining space end the listing; a terminating zero byte is
    /// written when room is left. A copy fault stops the listing and is returned.
    pub fn read_dir(&self, mut start_entry: u32, uio: &mut dyn Uio) -> Result<()> {
        let list = self.lock();
        let mut user_len = uio.resid();
        let mut record = Vec::with_capacity(2 * SYMLINK_NAME_MAX + 3);

        for alias in &list.entries {
            let total = alias.src.len() + alias.dst.len() + 3;
            let Ok(len) = u8::try_from(total) else {
                continue;
            };
            if start_entry != 0 {
                start_entry -= 1;
                continue;
            }
            if total > user_len {
                break;
            }
            record.clear();
            record.push(len);
            record.extend_from_slice(alias.src.as_bytes());
            record.push(0);
            record.extend_from_slice(alias.dst.as_bytes());
            record.push(0);
            uio.copy_out(&record)?;
            user_len -= total;
        }

        if user_len != 0 {
            uio.copy_out(&[0])?;
        }
        Ok(())
    }
}
