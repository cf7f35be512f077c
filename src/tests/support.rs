// In-memory doubles for the platform traits and the HTTP backend.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::UpdateError;
use crate::http::streaming::{HttpBackend, ResponseHead};
use crate::platform::{BankState, ByteChannel, KvStore, PartitionTable};

/// Scripted command/response byte channel standing in for the modem UART.
///
/// Each `write_all` (one AT command) queues the next scripted response for
/// reading. A command past the end of the script gets no response, which is
/// how timeout behavior is exercised.
pub struct MockChannel {
    script: VecDeque<Vec<u8>>,
    pending: VecDeque<u8>,
    written: Arc<Mutex<Vec<u8>>>,
    ready: bool,
    max_read: usize,
}

impl MockChannel {
    pub fn with_script(script: Vec<Vec<u8>>) -> Self {
        Self {
            script: script.into(),
            pending: VecDeque::new(),
            written: Arc::new(Mutex::new(Vec::new())),
            ready: true,
            max_read: usize::MAX,
        }
    }

    pub fn not_ready(mut self) -> Self {
        self.ready = false;
        self
    }

    /// Deliver at most `n` bytes per read call, modelling a slow UART.
    pub fn max_read(mut self, n: usize) -> Self {
        self.max_read = n;
        self
    }

    /// Handle onto everything written to the channel; survives the channel
    /// being moved into a client.
    pub fn written_log(&self) -> Arc<Mutex<Vec<u8>>> {
        self.written.clone()
    }
}

/// Split a written log into command lines.
pub fn commands(log: &Arc<Mutex<Vec<u8>>>) -> Vec<String> {
    String::from_utf8_lossy(&log.lock().unwrap())
        .split("\r\n")
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

impl ByteChannel for MockChannel {
    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, UpdateError> {
        if self.pending.is_empty() {
            // Nothing queued; behave like a quiet UART.
            std::thread::sleep(Duration::from_millis(1));
            return Ok(0);
        }
        let limit = buf.len().min(self.max_read);
        let mut n = 0;
        while n < limit {
            match self.pending.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), UpdateError> {
        self.written.lock().unwrap().extend_from_slice(data);
        if let Some(response) = self.script.pop_front() {
            self.pending.extend(response);
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready
    }
}

/// In-memory dual-bank partition table with failure injection.
pub struct MemPartitionTable {
    open: bool,
    end_called: bool,
    written: Vec<u8>,
    total_write_bytes: u64,
    bootable: bool,
    begin_calls: usize,
    write_calls: usize,
    abort_calls: usize,
    mark_calls: usize,
    fail_begin: bool,
    fail_write_at: Option<usize>,
    fail_end: bool,
    fail_mark: bool,
    running_state: BankState,
    confirmed: bool,
    restarted: bool,
}

impl MemPartitionTable {
    pub fn new() -> Self {
        Self {
            open: false,
            end_called: false,
            written: Vec::new(),
            total_write_bytes: 0,
            bootable: false,
            begin_calls: 0,
            write_calls: 0,
            abort_calls: 0,
            mark_calls: 0,
            fail_begin: false,
            fail_write_at: None,
            fail_end: false,
            fail_mark: false,
            running_state: BankState::Valid,
            confirmed: false,
            restarted: false,
        }
    }

    pub fn fail_begin(&mut self, fail: bool) {
        self.fail_begin = fail;
    }

    /// Fail the Nth write call (1-based).
    pub fn fail_write_at(&mut self, n: usize) {
        self.fail_write_at = Some(n);
    }

    pub fn fail_end(&mut self, fail: bool) {
        self.fail_end = fail;
    }

    pub fn fail_mark(&mut self, fail: bool) {
        self.fail_mark = fail;
    }

    pub fn set_running_state(&mut self, state: BankState) {
        self.running_state = state;
    }

    pub fn written(&self) -> &[u8] {
        &self.written
    }

    /// Bytes ever written, including writes later discarded by abort.
    pub fn total_write_bytes(&self) -> u64 {
        self.total_write_bytes
    }

    pub fn bootable(&self) -> bool {
        self.bootable
    }

    pub fn begin_calls(&self) -> usize {
        self.begin_calls
    }

    pub fn abort_calls(&self) -> usize {
        self.abort_calls
    }

    pub fn mark_calls(&self) -> usize {
        self.mark_calls
    }

    pub fn confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn restarted(&self) -> bool {
        self.restarted
    }
}

impl PartitionTable for MemPartitionTable {
    fn begin(&mut self) -> Result<(), UpdateError> {
        self.begin_calls += 1;
        if self.fail_begin {
            return Err(UpdateError::NoPartition);
        }
        if self.open {
            return Err(UpdateError::PartitionWrite("bank already open".to_string()));
        }
        self.open = true;
        self.end_called = false;
        self.written.clear();
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), UpdateError> {
        if !self.open {
            return Err(UpdateError::PartitionWrite("bank not open".to_string()));
        }
        self.write_calls += 1;
        if self.fail_write_at == Some(self.write_calls) {
            return Err(UpdateError::PartitionWrite("flash write failed".to_string()));
        }
        self.written.extend_from_slice(data);
        self.total_write_bytes += data.len() as u64;
        Ok(())
    }

    fn end(&mut self) -> Result<(), UpdateError> {
        if !self.open {
            return Err(UpdateError::ValidationFailed("bank not open".to_string()));
        }
        self.open = false;
        if self.fail_end {
            return Err(UpdateError::ValidationFailed(
                "platform image check failed".to_string(),
            ));
        }
        self.end_called = true;
        Ok(())
    }

    fn mark_bootable(&mut self) -> Result<(), UpdateError> {
        self.mark_calls += 1;
        if !self.end_called {
            return Err(UpdateError::MarkBootableFailed(
                "image not validated".to_string(),
            ));
        }
        if self.fail_mark {
            return Err(UpdateError::MarkBootableFailed(
                "boot partition update failed".to_string(),
            ));
        }
        self.bootable = true;
        Ok(())
    }

    fn abort(&mut self) {
        self.abort_calls += 1;
        self.open = false;
        self.written.clear();
    }

    fn running_bank_state(&self) -> BankState {
        self.running_state
    }

    fn confirm_running_bank(&mut self) {
        self.confirmed = true;
        self.running_state = BankState::Valid;
    }

    fn restart(&mut self) {
        self.restarted = true;
    }
}

/// In-memory key/value store.
pub struct MemKvStore {
    u32s: HashMap<String, u32>,
    strs: HashMap<String, String>,
}

impl MemKvStore {
    pub fn new() -> Self {
        Self {
            u32s: HashMap::new(),
            strs: HashMap::new(),
        }
    }
}

impl KvStore for MemKvStore {
    fn get_u32(&self, key: &str) -> Option<u32> {
        self.u32s.get(key).copied()
    }

    fn set_u32(&mut self, key: &str, value: u32) -> Result<(), UpdateError> {
        self.u32s.insert(key.to_string(), value);
        Ok(())
    }

    fn get_str(&self, key: &str) -> Option<String> {
        self.strs.get(key).cloned()
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), UpdateError> {
        self.strs.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// One scripted response hop for the streaming backend.
pub struct Hop {
    pub head: ResponseHead,
    pub location: Option<String>,
    pub body: Vec<u8>,
}

impl Hop {
    pub fn success(body: Vec<u8>) -> Self {
        Self {
            head: ResponseHead {
                status: 200,
                content_length: body.len() as u64,
            },
            location: None,
            body,
        }
    }

    pub fn redirect(status: u16, location: &str) -> Self {
        Self {
            head: ResponseHead {
                status,
                content_length: 0,
            },
            location: Some(location.to_string()),
            body: Vec::new(),
        }
    }

    pub fn status_only(status: u16) -> Self {
        Self {
            head: ResponseHead {
                status,
                content_length: 0,
            },
            location: None,
            body: Vec::new(),
        }
    }
}

/// Scripted HTTP backend: serves one `Hop` per `open`, body reads in
/// whatever sizes the caller asks for.
pub struct ScriptedBackend {
    hops: VecDeque<Hop>,
    requested: Vec<String>,
    location: Option<String>,
    body: VecDeque<u8>,
    read_calls: usize,
    /// Block before serving read number `gate_at` until the sender fires.
    gate: Option<(usize, Receiver<()>)>,
    fail_read_at: Option<usize>,
}

impl ScriptedBackend {
    pub fn new(hops: Vec<Hop>) -> Self {
        Self {
            hops: hops.into(),
            requested: Vec::new(),
            location: None,
            body: VecDeque::new(),
            read_calls: 0,
            gate: None,
            fail_read_at: None,
        }
    }

    pub fn gate_at_read(mut self, n: usize, rx: Receiver<()>) -> Self {
        self.gate = Some((n, rx));
        self
    }

    pub fn fail_read_at(mut self, n: usize) -> Self {
        self.fail_read_at = Some(n);
        self
    }

    pub fn requested_urls(&self) -> Vec<String> {
        self.requested.clone()
    }
}

impl HttpBackend for ScriptedBackend {
    fn open(&mut self, url: &str) -> Result<ResponseHead, UpdateError> {
        self.location = None;
        self.requested.push(url.to_string());
        let hop = self
            .hops
            .pop_front()
            .unwrap_or_else(|| panic!("backend script exhausted at {}", url));
        self.location = hop.location;
        self.body = hop.body.into();
        Ok(hop.head)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, UpdateError> {
        self.read_calls += 1;
        if let Some((at, rx)) = &self.gate {
            if self.read_calls == *at {
                rx.recv().expect("gate sender dropped");
            }
        }
        if self.fail_read_at == Some(self.read_calls) {
            return Err(UpdateError::ChannelIo("stream reset by peer".to_string()));
        }
        let mut n = 0;
        while n < buf.len() {
            match self.body.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn observed_redirect_target(&self) -> Option<String> {
        self.location.clone()
    }

    fn close(&mut self) {
        self.body.clear();
    }
}
