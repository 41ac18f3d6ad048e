#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use aero_usb_dev::{
    AccessMode, DevNode, Endpoint, EventWatcher, FifoIo, FifoMethods, ProcessContext, ReEnumState,
    Result, UsbDevConfig, UsbDevError, UsbDevFile, UsbDevRegistry, UsbDevice, UsbDeviceDesc,
    UsbFifo, FIFO_RX, FIFO_TX,
};

pub const BUS: u8 = 0;
pub const DEV: u8 = 1;
pub const BULK_EP: u8 = 1;

/// Handled by [`TestDriver::ioctl`]; writes 1 into the first data byte.
pub const TEST_IOCTL_PRE: u64 = 0xc004_5501;
/// Handled by [`TestDriver::ioctl_post`]; flags the device as re-enumerating when
/// `reenumerate_on_post` is set.
pub const TEST_IOCTL_POST: u64 = 0xc004_5502;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();
}

/// Driver standing in for the transfer engine.
///
/// With `auto_drain` set every `start_write` immediately moves queued packets to `written`;
/// otherwise tests drain explicitly with [`TestDriver::drain`].
pub struct TestDriver {
    pub bufsize: usize,
    pub nbuf: u16,
    pub auto_drain: AtomicBool,
    pub reenumerate_on_post: AtomicBool,
    pub written: Mutex<Vec<Vec<u8>>>,
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub read_starts: AtomicUsize,
    pub post_calls: AtomicUsize,
    device: Mutex<Option<Arc<UsbDevice>>>,
}

impl TestDriver {
    pub fn new(bufsize: usize, nbuf: u16) -> Arc<Self> {
        Arc::new(Self {
            bufsize,
            nbuf,
            auto_drain: AtomicBool::new(true),
            reenumerate_on_post: AtomicBool::new(false),
            written: Mutex::new(Vec::new()),
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            read_starts: AtomicUsize::new(0),
            post_calls: AtomicUsize::new(0),
            device: Mutex::new(None),
        })
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }

    fn drain_io(&self, io: &mut FifoIo<'_>) {
        let mut buf = vec![0u8; self.bufsize.max(1)];
        loop {
            let (n, produced) = io.get_data_linear(&mut buf, true);
            if !produced {
                break;
            }
            self.written.lock().unwrap().push(buf[..n].to_vec());
        }
    }

    /// Completes every queued transmission on `fifo`, finishing a pending flush.
    pub fn drain(&self, fifo: &UsbFifo) {
        fifo.with_io(|io| self.drain_io(io));
    }
}

impl FifoMethods for TestDriver {
    fn open(&self, fifo: &Arc<UsbFifo>, _access: AccessMode) -> Result<()> {
        fifo.alloc_buffer(self.bufsize, self.nbuf);
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self, fifo: &Arc<UsbFifo>, _access: AccessMode) {
        fifo.free_buffer();
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn ioctl(
        &self,
        _fifo: &Arc<UsbFifo>,
        cmd: u64,
        data: &mut [u8],
        _access: AccessMode,
    ) -> Result<()> {
        match cmd {
            TEST_IOCTL_PRE => {
                data[0] = 1;
                Ok(())
            }
            _ => Err(UsbDevError::Unhandled),
        }
    }

    fn ioctl_post(
        &self,
        _fifo: &Arc<UsbFifo>,
        cmd: u64,
        _data: &mut [u8],
        _access: AccessMode,
    ) -> Result<()> {
        match cmd {
            TEST_IOCTL_POST => {
                self.post_calls.fetch_add(1, Ordering::SeqCst);
                if self.reenumerate_on_post.load(Ordering::SeqCst) {
                    if let Some(device) = self.device.lock().unwrap().as_ref() {
                        device.set_re_enumerate_state(ReEnumState::Start);
                    }
                }
                Ok(())
            }
            _ => Err(UsbDevError::Unhandled),
        }
    }

    fn start_read(&self, io: &mut FifoIo<'_>) {
        self.read_starts.fetch_add(1, Ordering::SeqCst);
        io.clear_flushing();
    }

    fn start_write(&self, io: &mut FifoIo<'_>) {
        if self.auto_drain.load(Ordering::SeqCst) {
            self.drain_io(io);
        }
    }
}

#[derive(Debug, Default)]
pub struct TestProc {
    pub pid: u32,
    pub pgid: i32,
    pub privileged: bool,
    pub signal: AtomicBool,
    pub sigio: AtomicUsize,
}

impl TestProc {
    pub fn new(pid: u32, pgid: i32) -> Arc<Self> {
        Arc::new(Self {
            pid,
            pgid,
            ..Self::default()
        })
    }

    pub fn privileged() -> Arc<Self> {
        Arc::new(Self {
            pid: 1,
            privileged: true,
            ..Self::default()
        })
    }

    pub fn sigio_count(&self) -> usize {
        self.sigio.load(Ordering::SeqCst)
    }
}

impl ProcessContext for TestProc {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn pgid(&self) -> i32 {
        self.pgid
    }

    fn signal_pending(&self) -> bool {
        self.signal.load(Ordering::SeqCst)
    }

    fn post_sigio(&self) {
        self.sigio.fetch_add(1, Ordering::SeqCst);
    }

    fn is_privileged(&self) -> bool {
        self.privileged
    }
}

pub fn as_ctx(proc: &Arc<TestProc>) -> Arc<dyn ProcessContext> {
    Arc::clone(proc) as Arc<dyn ProcessContext>
}

#[derive(Default)]
pub struct CountingWatcher {
    pub hits: AtomicUsize,
}

impl CountingWatcher {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl EventWatcher for CountingWatcher {
    fn notify(&self) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }
}

/// A registry with one device exposing bulk endpoint 1 in both directions.
pub struct Rig {
    pub registry: UsbDevRegistry,
    pub device: Arc<UsbDevice>,
    pub driver: Arc<TestDriver>,
    pub proc: Arc<TestProc>,
    pub ctx: Arc<dyn ProcessContext>,
}

impl Rig {
    pub fn new() -> Self {
        Self::with_driver(TestDriver::new(16, 4))
    }

    pub fn with_driver(driver: Arc<TestDriver>) -> Self {
        init_tracing();
        let registry = UsbDevRegistry::new(UsbDevConfig {
            max_buses: 2,
            max_devices: 4,
            fifo_max: 16,
            reenum_poll_interval: Duration::from_millis(1),
            signal_poll_interval: Duration::from_millis(2),
            ..UsbDevConfig::default()
        })
        .unwrap();
        let device = registry
            .attach_device(
                BUS,
                DEV,
                UsbDeviceDesc {
                    endpoints: vec![
                        Endpoint {
                            address: 0x80 | BULK_EP,
                            iface_index: 0,
                        },
                        Endpoint {
                            address: BULK_EP,
                            iface_index: 0,
                        },
                    ],
                    generic_methods: driver.clone(),
                    ..UsbDeviceDesc::default()
                },
            )
            .unwrap();
        *driver.device.lock().unwrap() = Some(Arc::clone(&device));
        let proc = TestProc::new(100, 100);
        let ctx = as_ctx(&proc);
        Self {
            registry,
            device,
            driver,
            proc,
            ctx,
        }
    }

    pub fn node(&self, ep: u8) -> DevNode {
        DevNode::for_endpoint(BUS, DEV, ep, AccessMode::READ | AccessMode::WRITE)
    }

    pub fn open(&self, ep: u8, access: AccessMode) -> Result<UsbDevFile> {
        self.registry.open(&self.node(ep), access, &self.ctx)
    }

    pub fn rx_of(&self, file: &UsbDevFile) -> Arc<UsbFifo> {
        let loc = file.location().unwrap();
        self.registry
            .fifo(BUS, DEV, usize::from(loc.fifo_index) + FIFO_RX)
            .unwrap()
    }

    pub fn tx_of(&self, file: &UsbDevFile) -> Arc<UsbFifo> {
        let loc = file.location().unwrap();
        self.registry
            .fifo(BUS, DEV, usize::from(loc.fifo_index) + FIFO_TX)
            .unwrap()
    }
}

/// Polls `cond` until it holds or two seconds pass.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}
