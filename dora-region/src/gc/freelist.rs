use parking_lot::Mutex;

use crate::gc::block::{Block, BlockState};

/// Lock-protected pool of blocks shared by all threads.
pub struct BlockList {
    blocks: Mutex<Vec<Block>>,
}

impl BlockList {
    pub fn new() -> BlockList {
        BlockList {
            blocks: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, block: Block) {
        self.blocks.lock().push(block);
    }

    pub fn append(&self, blocks: &mut Vec<Block>) {
        self.blocks.lock().append(blocks);
    }

    pub fn pop(&self) -> Option<Block> {
        self.blocks.lock().pop()
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }

    pub fn contains(&self, block: Block) -> bool {
        self.blocks.lock().contains(&block)
    }

    pub fn take(&self) -> Vec<Block> {
        std::mem::take(&mut *self.blocks.lock())
    }
}

impl Default for BlockList {
    fn default() -> BlockList {
        BlockList::new()
    }
}

/// Free blocks cached by one thread. Overflow goes to the global list.
pub struct LocalFreeList {
    blocks: Vec<Block>,
    capacity: usize,
}

impl LocalFreeList {
    pub fn new(capacity: usize) -> LocalFreeList {
        LocalFreeList {
            blocks: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Keeps the block locally if there is room, otherwise hands it to
    /// `global`.
    pub fn push(&mut self, block: Block, global: &BlockList) {
        debug_assert_eq!(block.state(), BlockState::Free);

        if self.blocks.len() < self.capacity {
            self.blocks.push(block);
        } else {
            global.push(block);
        }
    }

    pub fn pop(&mut self) -> Option<Block> {
        self.blocks.pop()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains(&self, block: Block) -> bool {
        self.blocks.contains(&block)
    }

    pub fn flush(&mut self, global: &BlockList) {
        global.append(&mut self.blocks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::block::{BlockInfo, BlockLayout};
    use crate::gc::{Address, K};
    use std::ptr::NonNull;

    fn blocks(count: usize, memory: &mut Vec<usize>) -> Vec<Box<BlockInfo>> {
        let layout = BlockLayout {
            block_size: 8 * K,
            line_size: 128,
        };
        memory.resize(count * 8 * K / 8, 0);
        let start = Address::from_ptr(memory.as_ptr());

        (0..count)
            .map(|idx| Box::new(BlockInfo::new(start.offset(idx * 8 * K), layout)))
            .collect()
    }

    fn handle(info: &BlockInfo) -> Block {
        Block::from_info(NonNull::from(info))
    }

    #[test]
    fn local_list_overflows_into_global() {
        let mut memory = Vec::new();
        let infos = blocks(3, &mut memory);
        let global = BlockList::new();
        let mut local = LocalFreeList::new(2);

        for info in &infos {
            local.push(handle(info), &global);
        }

        assert_eq!(local.len(), 2);
        assert_eq!(global.len(), 1);
        assert!(global.contains(handle(&infos[2])));

        assert_eq!(local.pop(), Some(handle(&infos[1])));
        local.flush(&global);
        assert!(local.is_empty());
        assert_eq!(global.len(), 2);
        assert_eq!(global.take().len(), 2);
        assert!(global.is_empty());
    }
}
