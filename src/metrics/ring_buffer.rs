
/// A fixed-capacity buffer that keeps the most recent values. Storage is allocated once up front;
///  once full, each new value overwrites the oldest one.
#[derive(Debug)]
pub struct RingBuffer<T> {
    capacity: usize,
    buf: BufferImpl<T>,
}

#[derive(Debug)]
enum BufferImpl<T> {
    Growing(Vec<T>),
    Ring {
        buf: Vec<T>,
        next: usize,
    },
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> RingBuffer<T> {
        assert!(capacity > 0);
        RingBuffer {
            capacity,
            buf: BufferImpl::Growing(Vec::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        match &self.buf {
            BufferImpl::Growing(buf) => buf.len(),
            BufferImpl::Ring { buf, .. } => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// adds a new value, returning the value that was evicted in its place (if any)
    pub fn push(&mut self, value: T) -> Option<T> {
        match &mut self.buf {
            BufferImpl::Growing(buf) => {
                buf.push(value);
                if buf.len() == self.capacity {
                    let buf = std::mem::take(buf);
                    self.buf = BufferImpl::Ring { buf, next: 0 };
                }
                None
            }
            BufferImpl::Ring { buf, next } => {
                let evicted = std::mem::replace(&mut buf[*next], value);
                *next = (*next + 1) % self.capacity;
                Some(evicted)
            }
        }
    }

    /// the most recently added value
    pub fn latest(&self) -> Option<&T> {
        match &self.buf {
            BufferImpl::Growing(buf) => buf.last(),
            BufferImpl::Ring { buf, next } => buf.get((*next + self.capacity - 1) % self.capacity),
        }
    }

    /// iterates oldest first
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        let (newer, older): (&[T], &[T]) = match &self.buf {
            BufferImpl::Growing(buf) => (&[], buf),
            BufferImpl::Ring { buf, next } => buf.split_at(*next),
        };
        older.iter().chain(newer.iter())
    }
}
