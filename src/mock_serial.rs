//! We use this mocking module in unit tests to emulate the PSU's serial port.
//!
//! Like the real device it is half duplex: a scripted response only becomes readable once a
//! request has been written and flushed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Our mock type used to emulate a serial port. Clones share the same port.
#[derive(Clone, Default)]
pub struct MockSerial {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    /// Bytes of the request currently being written
    write_buffer: heapless::Vec<u8, 256>,
    /// Data waiting to be read
    read_buffer: heapless::Vec<u8, 256>,
    /// Current position in the read buffer
    read_position: usize,
    /// Nothing can be read before this instant
    ready_at: Option<Instant>,
    /// Every complete request, in order
    requests: Vec<Vec<u8>>,
    /// What the device answers to each request and after how long; `None` means it stays silent
    responses: VecDeque<Option<(Vec<u8>, Duration)>>,
    /// Flag to simulate write errors
    should_error_on_write: bool,
    /// Flag to simulate read errors
    should_error_on_read: bool,
}

#[derive(Debug)]
pub enum MockSerialError {
    /// Simulated buffer overflow
    BufferOverflow,
    /// Generic simulated error for testing
    SimulatedError,
    /// Would block - no data available
    WouldBlock,
}

impl embedded_io::Error for MockSerialError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            MockSerialError::BufferOverflow => embedded_io::ErrorKind::OutOfMemory,
            MockSerialError::SimulatedError => embedded_io::ErrorKind::BrokenPipe,
            MockSerialError::WouldBlock => embedded_io::ErrorKind::Other,
        }
    }
}

impl embedded_io::ErrorType for MockSerial {
    type Error = MockSerialError;
}

impl embedded_io::Write for MockSerial {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        let mut state = self.lock();
        if state.should_error_on_write {
            return Err(MockSerialError::SimulatedError);
        }
        state
            .write_buffer
            .extend_from_slice(buf)
            .map_err(|_| MockSerialError::BufferOverflow)?;
        Ok(buf.len())
    }

    /// A flush ends the request; the device answers with its next scripted response.
    fn flush(&mut self) -> Result<(), Self::Error> {
        let mut state = self.lock();
        if state.should_error_on_write {
            return Err(MockSerialError::SimulatedError);
        }
        let request = state.write_buffer.to_vec();
        state.write_buffer.clear();
        state.requests.push(request);
        if let Some(Some((response, delay))) = state.responses.pop_front() {
            state.load(&response)?;
            state.ready_at = Some(Instant::now() + delay);
        }
        Ok(())
    }
}

impl embedded_io::Read for MockSerial {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let mut state = self.lock();
        if state.should_error_on_read {
            return Err(MockSerialError::SimulatedError);
        }
        if state.read_position >= state.read_buffer.len()
            || state.ready_at.is_some_and(|ready_at| Instant::now() < ready_at)
        {
            return Err(MockSerialError::WouldBlock);
        }

        let available_bytes = state.read_buffer.len() - state.read_position;
        let bytes_to_read = core::cmp::min(buf.len(), available_bytes);
        let start = state.read_position;
        buf[..bytes_to_read].copy_from_slice(&state.read_buffer[start..start + bytes_to_read]);
        state.read_position += bytes_to_read;
        Ok(bytes_to_read)
    }
}

impl MockState {
    fn load(&mut self, data: &[u8]) -> Result<(), MockSerialError> {
        self.read_buffer.clear();
        self.read_position = 0;
        self.ready_at = None;
        self.read_buffer
            .extend_from_slice(data)
            .map_err(|_| MockSerialError::BufferOverflow)
    }
}

impl MockSerial {
    /// Create a new MockSerial instance with empty buffers
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Answer the next request with `data`.
    pub fn queue_response(&self, data: &[u8]) {
        self.queue_delayed_response(data, Duration::ZERO);
    }

    /// Answer the next request with `data`, but only `delay` after it was flushed.
    pub fn queue_delayed_response(&self, data: &[u8], delay: Duration) {
        self.lock().responses.push_back(Some((data.to_vec(), delay)));
    }

    /// Do not answer the next request.
    pub fn queue_silence(&self) {
        self.lock().responses.push_back(None);
    }

    /// Make `data` readable right away, as if the device sent it on its own.
    pub fn push_unsolicited(&self, data: &[u8]) {
        self.lock().load(data).unwrap();
    }

    /// Every request written so far.
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.lock().requests.clone()
    }

    /// Configure whether write operations should fail with an error
    pub fn set_write_error(&self, should_error: bool) {
        self.lock().should_error_on_write = should_error;
    }

    /// Configure whether read operations should fail with an error
    pub fn set_read_error(&self, should_error: bool) {
        self.lock().should_error_on_read = should_error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_io::{Error, Read, Write};

    #[test]
    fn test_response_only_after_flush() {
        let mut mock = MockSerial::new();
        mock.queue_response(b"Response data");

        let mut buffer = [0u8; 20];
        mock.write_all(b"request").unwrap();
        assert!(matches!(
            mock.read(&mut buffer),
            Err(MockSerialError::WouldBlock)
        ));

        mock.flush().unwrap();
        let read = mock.read(&mut buffer).unwrap();
        assert_eq!(&buffer[..read], b"Response data");
        assert_eq!(mock.requests(), vec![b"request".to_vec()]);
    }

    #[test]
    fn test_delayed_response() {
        let mut mock = MockSerial::new();
        mock.queue_delayed_response(b"late", Duration::from_millis(30));

        mock.write_all(b"request").unwrap();
        mock.flush().unwrap();
        let mut buffer = [0u8; 10];
        assert!(matches!(
            mock.read(&mut buffer),
            Err(MockSerialError::WouldBlock)
        ));

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(mock.read(&mut buffer).unwrap(), 4);
    }

    #[test]
    fn test_read_partial_data() {
        let mut mock = MockSerial::new();
        mock.push_unsolicited(b"Long response data");

        let mut buffer = [0u8; 5];
        assert_eq!(mock.read(&mut buffer).unwrap(), 5);
        assert_eq!(&buffer, b"Long ");
    }

    #[test]
    fn test_silence_leaves_nothing_to_read() {
        let mut mock = MockSerial::new();
        mock.queue_silence();
        mock.queue_response(b"second");

        mock.write_all(b"one").unwrap();
        mock.flush().unwrap();
        let mut buffer = [0u8; 10];
        assert!(mock.read(&mut buffer).is_err());

        mock.write_all(b"two").unwrap();
        mock.flush().unwrap();
        assert_eq!(mock.read(&mut buffer).unwrap(), 6);
    }

    #[test]
    fn test_write_buffer_overflow() {
        let mut mock = MockSerial::new();
        let large_data = vec![0u8; 300]; // Larger than 256 byte capacity

        let result = mock.write(&large_data);
        assert!(matches!(result, Err(MockSerialError::BufferOverflow)));
    }

    #[test]
    fn test_error_flags_toggle() {
        let mut mock = MockSerial::new();

        mock.set_write_error(true);
        assert!(mock.write(b"test").is_err());
        assert!(mock.flush().is_err());
        mock.set_write_error(false);
        assert!(mock.write(b"test").is_ok());

        mock.push_unsolicited(b"data");
        mock.set_read_error(true);
        let mut buffer = [0u8; 10];
        assert!(mock.read(&mut buffer).is_err());
        mock.set_read_error(false);
        assert!(mock.read(&mut buffer).is_ok());
    }

    #[test]
    fn test_error_kinds() {
        assert!(matches!(
            MockSerialError::WouldBlock.kind(),
            embedded_io::ErrorKind::Other
        ));
        assert!(matches!(
            MockSerialError::BufferOverflow.kind(),
            embedded_io::ErrorKind::OutOfMemory
        ));
    }
}
