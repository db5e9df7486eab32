/// `TcpBuffer` is a per-connection byte buffer with independent read/write cursors.
///
/// Bytes in `[read_index, write_index)` are readable, bytes in `[write_index, capacity)` are writable.
/// It grows (doubling) when there's no room and compacts when the read cursor advances far enough.
/// It's owned and mutated only by the EventLoop thread of its connection.
pub struct TcpBuffer {
    buffer: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Default for TcpBuffer {
    fn default() -> Self {
        Self::new(128)
    }
}

impl TcpBuffer {
    pub fn new(size: usize) -> Self {
        Self {
            buffer: vec![0u8; size.max(1)],
            read_index: 0,
            write_index: 0,
        }
    }

    /// number of unread bytes.
    pub fn readable(&self) -> usize {
        self.write_index - self.read_index
    }
    /// number of bytes that can be written without growing.
    pub fn writable(&self) -> usize {
        self.buffer.len() - self.write_index
    }
    pub fn read_index(&self) -> usize {
        self.read_index
    }
    pub fn write_index(&self) -> usize {
        self.write_index
    }
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Append bytes, growing the buffer first if there's not enough room.
    pub fn write(&mut self, buf: &[u8]) {
        if buf.len() > self.writable() {
            let new_size = std::cmp::max(self.buffer.len() * 2, self.write_index + buf.len());
            self.resize(new_size);
        }
        self.buffer[self.write_index..self.write_index + buf.len()].copy_from_slice(buf);
        self.write_index += buf.len();
    }

    /// Copy out and consume up to `n` unread bytes.
    pub fn read(&mut self, n: usize) -> Vec<u8> {
        let out = self.peek(n);
        self.advance_read(out.len());
        out
    }

    /// Copy out up to `n` unread bytes without consuming them.
    pub fn peek(&self, n: usize) -> Vec<u8> {
        let n = std::cmp::min(n, self.readable());
        self.buffer[self.read_index..self.read_index + n].to_vec()
    }

    /// The unread bytes.
    pub fn readable_slice(&self) -> &[u8] {
        &self.buffer[self.read_index..self.write_index]
    }

    /// The free tail of the buffer. Call `advance_write` after filling it.
    pub fn writable_slice_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.write_index..]
    }

    /// Consume `n` readable bytes. `n` is clamped to the readable length.
    pub fn advance_read(&mut self, n: usize) {
        let n = std::cmp::min(n, self.readable());
        self.read_index += n;
        if self.read_index == self.write_index {
            // all consumed, rewind for free.
            self.read_index = 0;
            self.write_index = 0;
        } else {
            self.compact();
        }
    }

    /// Commit `n` bytes written through `writable_slice_mut`. `n` is clamped to the writable length.
    pub fn advance_write(&mut self, n: usize) {
        let n = std::cmp::min(n, self.writable());
        self.write_index += n;
    }

    /// Double the capacity.
    pub fn grow(&mut self) {
        let new_size = self.buffer.len() * 2;
        self.resize(new_size);
    }

    /// Move unread bytes to the front once a third of the buffer has been consumed.
    pub fn compact(&mut self) {
        if self.read_index < self.buffer.len() / 3 {
            return;
        }
        self.buffer.copy_within(self.read_index..self.write_index, 0);
        self.write_index -= self.read_index;
        self.read_index = 0;
    }

    /// Resize keeping unread bytes. Never shrinks below the readable length.
    pub fn resize(&mut self, new_size: usize) {
        let count = self.readable();
        let new_size = std::cmp::max(new_size, count);
        let mut tmp = vec![0u8; new_size];
        tmp[..count].copy_from_slice(self.readable_slice());
        self.buffer = tmp;
        self.read_index = 0;
        self.write_index = count;
    }
}
