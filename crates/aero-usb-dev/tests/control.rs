mod util;

use std::sync::{Arc, Mutex};

use aero_usb_dev::{
    ControlRequest, FifoAttachRequest, FifoName, ProcessContext, QuirkHandler, QuirkOp, ReadUio,
    Result, UsbDevError, SYMLINK_NAME_MAX,
};
use util::{Rig, TestDriver, TestProc};

#[derive(Default)]
struct RecordingQuirks {
    seen: Mutex<Vec<(QuirkOp, u32)>>,
}

impl QuirkHandler for RecordingQuirks {
    fn quirk_ioctl(&self, op: QuirkOp, data: &mut [u8], proc: &dyn ProcessContext) -> Result<()> {
        if op == QuirkOp::DevQuirkAdd && !proc.is_privileged() {
            return Err(UsbDevError::PermissionDenied);
        }
        self.seen.lock().unwrap().push((op, proc.pid()));
        data[0] = 0x5a;
        Ok(())
    }
}

fn read_dir(rig: &Rig, start_entry: u32, len: usize) -> Vec<u8> {
    let mut buf = vec![0xffu8; len];
    let mut uio = ReadUio::new(&mut buf);
    rig.registry
        .control()
        .ioctl(
            ControlRequest::ReadDir {
                start_entry,
                uio: &mut uio,
            },
            rig.proc.as_ref(),
        )
        .unwrap();
    let n = uio.transferred();
    buf.truncate(n);
    buf
}

#[test]
fn read_dir_lists_attached_aliases() {
    let rig = Rig::new();
    assert_eq!(read_dir(&rig, 0, 16), vec![0]);

    let sc = rig
        .registry
        .fifo_attach(
            &rig.device,
            FifoAttachRequest::new(TestDriver::new(8, 2), FifoName::new("ulpt"), 0),
        )
        .unwrap();

    let mut expected = vec![13u8];
    expected.extend_from_slice(b"ulpt0\0ulpt0\0");
    expected.push(0);
    assert_eq!(read_dir(&rig, 0, 64), expected);

    // Skipped records and records that do not fit are left out.
    assert_eq!(read_dir(&rig, 1, 64), vec![0]);
    assert_eq!(read_dir(&rig, 0, 4), vec![0]);

    rig.registry.fifo_detach(sc);
    assert_eq!(read_dir(&rig, 0, 64), vec![0]);
}

#[test]
fn long_alias_names_are_truncated() {
    let rig = Rig::new();
    let long = "x".repeat(SYMLINK_NAME_MAX + 8);
    let sc = rig
        .registry
        .fifo_attach(
            &rig.device,
            FifoAttachRequest::new(TestDriver::new(8, 2), FifoName::new(&long), 7),
        )
        .unwrap();
    let names = rig.registry.symlinks();
    assert_eq!(names.len(), 1);
    assert_eq!(names[0].len(), SYMLINK_NAME_MAX);
    rig.registry.fifo_detach(sc);
}

#[test]
fn template_changes_need_privilege() {
    let rig = Rig::new();
    let control = rig.registry.control();

    assert_eq!(
        control.ioctl(ControlRequest::SetTemplate(3), rig.proc.as_ref()),
        Err(UsbDevError::PermissionDenied)
    );

    let root = TestProc::privileged();
    control
        .ioctl(ControlRequest::SetTemplate(3), root.as_ref())
        .unwrap();

    let mut value = -1;
    control
        .ioctl(ControlRequest::GetTemplate(&mut value), rig.proc.as_ref())
        .unwrap();
    assert_eq!(value, 3);
    assert_eq!(control.template(), 3);
}

#[test]
fn quirk_requests_go_to_the_handler() {
    let rig = Rig::new();
    let control = rig.registry.control();
    let mut data = [0u8; 8];

    assert_eq!(
        control.ioctl(
            ControlRequest::Quirk {
                op: QuirkOp::DevQuirkGet,
                data: &mut data,
            },
            rig.proc.as_ref(),
        ),
        Err(UsbDevError::NotSupported)
    );

    let quirks = Arc::new(RecordingQuirks::default());
    control.set_quirk_handler(Some(quirks.clone()));

    control
        .ioctl(
            ControlRequest::Quirk {
                op: QuirkOp::QuirkNameGet,
                data: &mut data,
            },
            rig.proc.as_ref(),
        )
        .unwrap();
    assert_eq!(data[0], 0x5a);
    assert_eq!(
        control.ioctl(
            ControlRequest::Quirk {
                op: QuirkOp::DevQuirkAdd,
                data: &mut data,
            },
            rig.proc.as_ref(),
        ),
        Err(UsbDevError::PermissionDenied)
    );
    assert_eq!(
        *quirks.seen.lock().unwrap(),
        vec![(QuirkOp::QuirkNameGet, rig.proc.pid)]
    );

    control.set_quirk_handler(None);
    assert_eq!(
        control.quirk(QuirkOp::DevQuirkRemove, &mut data, rig.proc.as_ref()),
        Err(UsbDevError::NotSupported)
    );
}

#[test]
fn unknown_control_requests_are_not_supported() {
    let rig = Rig::new();
    assert_eq!(
        rig.registry
            .control()
            .ioctl(ControlRequest::Other(0x4004_55ff), rig.proc.as_ref()),
        Err(UsbDevError::NotSupported)
    );
}
