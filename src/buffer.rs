/// Receive ring buffer. The transport writes at the tail, the frame
/// decoder copies frames out of the head, across the wraparound point.
#[derive(Debug)]
pub struct RingBuffer {
    data: Box<[u8]>,
    read_pos: usize,
    len: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> RingBuffer {
        RingBuffer {
            data: vec![0; capacity].into_boxed_slice(),
            read_pos: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn free(&self) -> usize {
        self.data.len() - self.len
    }

    /// Append `bytes`, returns how many fit. The rest is an overrun.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let cap = self.data.len();
        let count = bytes.len().min(self.free());
        let write_pos = (self.read_pos + self.len) % cap.max(1);
        let first = count.min(cap - write_pos);
        self.data[write_pos..write_pos + first].copy_from_slice(&bytes[..first]);
        self.data[..count - first].copy_from_slice(&bytes[first..count]);
        self.len += count;
        count
    }

    /// Copy from the head into `dst` without consuming. Returns the count.
    pub fn copy_out(&self, dst: &mut [u8]) -> usize {
        let count = dst.len().min(self.len);
        let first = count.min(self.data.len() - self.read_pos);
        dst[..first].copy_from_slice(&self.data[self.read_pos..self.read_pos + first]);
        dst[first..count].copy_from_slice(&self.data[..count - first]);
        count
    }

    pub fn consume(&mut self, len: usize) {
        assert!(len <= self.len());
        if len == self.len {
            self.clear();
        } else {
            self.read_pos = (self.read_pos + len) % self.data.len();
            self.len -= len;
        }
    }

    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.len = 0;
    }
}
