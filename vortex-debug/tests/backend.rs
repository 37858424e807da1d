//! End-to-end backend tests against the in-process target model.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vortex_debug::dm::{self, DmReg};
use vortex_debug::riscv::assembly;
use vortex_debug::transport::{Access, FakeTransport, TargetModel};
use vortex_debug::{Backend, HaltCause};

fn setup(clusters: u32, cores: u32, warps: u32, threads_log2: u32) -> (Backend, Arc<Mutex<TargetModel>>) {
    let transport = FakeTransport::new(TargetModel::new(clusters, cores, warps, threads_log2));
    let model = transport.handle();
    let mut backend = Backend::new(Box::new(transport));
    backend.set_poll_policy(10, Duration::from_millis(1));
    backend.connect(&HashMap::new()).unwrap();
    backend.initialize().unwrap();
    (backend, model)
}

/// Halts everything and selects warp 0 thread 0, the precondition for
/// state access.
fn setup_halted() -> (Backend, Arc<Mutex<TargetModel>>) {
    let (mut backend, model) = setup(1, 1, 4, 2);
    backend.halt_all_warps().unwrap();
    backend.select_warp_thread(0, 0).unwrap();
    (backend, model)
}

#[test]
fn wake_and_query_platform() {
    // 13 clusters x 188 cores x 9 warps, 1 thread per warp.
    let (backend, _) = setup(13, 188, 9, 0);

    let info = backend.platform_info().unwrap();
    assert_eq!(info.platform_id, 1);
    assert_eq!(info.platform_name, "Vortex");
    assert_eq!(info.num_clusters, 13);
    assert_eq!(info.num_cores_per_cluster, 188);
    assert_eq!(info.num_warps_per_core, 9);
    assert_eq!(info.num_threads_per_warp, 1);
    assert_eq!(info.total_warps(), 13 * 188 * 9);
    assert_eq!(info.total_threads(), info.total_warps());
}

#[test]
fn halt_all_then_step() {
    let (mut backend, model) = setup(1, 1, 4, 2);

    backend.halt_all_warps().unwrap();
    backend.select_warp_thread(0, 0).unwrap();
    backend.step_warp().unwrap();

    let m = model.lock().unwrap();
    let writes: Vec<(u32, u32)> = m
        .log
        .iter()
        .filter_map(|a| match a {
            Access::Write(addr, v) => Some((*addr, *v)),
            _ => None,
        })
        .collect();

    // Window 0 selected with a full mask.
    let wmask_at = writes
        .iter()
        .position(|&(a, v)| a == DmReg::Wmask.addr() && v == 0xFFFF_FFFF)
        .expect("full WMASK written");
    // Halt request follows the mask.
    let haltreq_mask = dm::field_info(DmReg::Dctrl, "haltreq").unwrap().mask();
    let haltreq_at = writes
        .iter()
        .position(|&(a, v)| a == DmReg::Dctrl.addr() && v & haltreq_mask != 0)
        .expect("haltreq written");
    assert!(haltreq_at > wmask_at);

    // Then warp/thread selection, then the step request.
    let stepreq_mask = dm::field_info(DmReg::Dctrl, "stepreq").unwrap().mask();
    let stepreq_at = writes
        .iter()
        .position(|&(a, v)| a == DmReg::Dctrl.addr() && v & stepreq_mask != 0)
        .expect("stepreq written");
    assert!(stepreq_at > haltreq_at);

    // The step advanced the PC and the cache followed.
    assert_eq!(m.warps[0].pc, 4);
    drop(m);
    assert_eq!(backend.selected_warp_pc(false).unwrap(), 4);
}

#[test]
fn unaligned_memory_write_preserves_neighbors() {
    let (mut backend, model) = setup_halted();
    {
        let mut m = model.lock().unwrap();
        m.set_mem_word(0x1000, 0xAABB_CCDD); // bytes DD CC BB AA
        m.set_mem_word(0x1004, 0x4433_2211); // bytes 11 22 33 44
    }

    backend.write_mem(0x1002, &[0xEE, 0xFF, 0x00]).unwrap();

    let m = model.lock().unwrap();
    assert_eq!(
        m.mem_bytes(0x1000, 8),
        vec![0xDD, 0xCC, 0xEE, 0xFF, 0x00, 0x22, 0x33, 0x44]
    );
}

#[test]
fn memory_roundtrip_unaligned_spans() {
    let (mut backend, _) = setup_halted();

    for (addr, len) in [(0x2000u32, 4usize), (0x2001, 3), (0x2002, 9), (0x2003, 1), (0x2000, 64)] {
        let data: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(addr as u8)).collect();
        backend.write_mem(addr, &data).unwrap();
        assert_eq!(backend.read_mem(addr, len as u32).unwrap(), data, "at {addr:#x}+{len}");
    }
}

#[test]
fn software_breakpoint_roundtrip() {
    let (mut backend, model) = setup_halted();
    model.lock().unwrap().set_mem_word(0x400, 0x0000_0093); // addi x1, x0, 0

    assert_eq!(
        backend.read_mem(0x400, 4).unwrap(),
        vec![0x93, 0x00, 0x00, 0x00]
    );

    backend.set_breakpoint(0x400).unwrap();
    assert_eq!(
        backend.read_mem(0x400, 4).unwrap(),
        vec![0x73, 0x00, 0x10, 0x00]
    );
    assert!(backend.has_breakpoints());
    // Setting again is a no-op, and the replaced word is kept.
    backend.set_breakpoint(0x400).unwrap();
    assert_eq!(backend.breakpoints()[0].replaced_instr, 0x0000_0093);

    backend.remove_breakpoint(0x400).unwrap();
    assert_eq!(
        backend.read_mem(0x400, 4).unwrap(),
        vec![0x93, 0x00, 0x00, 0x00]
    );
    assert!(!backend.has_breakpoints());
}

#[test]
fn continue_until_breakpoint_hits() {
    let (mut backend, model) = setup_halted();
    {
        let mut m = model.lock().unwrap();
        m.set_mem_word(0x400, 0x0000_0093);
        m.set_mem_word(0x408, 0x0000_0093);
        m.warps[0].pc = 0x400;
    }

    backend.set_breakpoint(0x408).unwrap();
    let wid = backend.continue_until_breakpoint(true).unwrap();
    assert_eq!(wid, 0);

    let bps = backend.breakpoints();
    assert_eq!(bps[0].hit_count, 1);
    assert_eq!(backend.selected_warp_pc(true).unwrap(), 0x408);

    let m = model.lock().unwrap();
    assert!(m.warps[0].halted);
    assert_eq!(m.warps[0].hacause, 1);
}

#[test]
fn poll_exhaustion_counts_attempts() {
    let (mut backend, model) = setup(1, 1, 4, 0);
    {
        let mut m = model.lock().unwrap();
        m.assert_ndmreset();
        m.stuck_ndmreset = true;
        m.log.clear();
    }
    backend.set_poll_policy(5, Duration::from_millis(1));

    let err = backend
        .dm_poll_field(DmReg::Dctrl, "ndmreset", 0, None, None)
        .unwrap_err();
    match err {
        vortex_debug::DebugError::PollTimeout { last, .. } => assert_eq!(last, 1),
        other => panic!("expected PollTimeout, got {other:?}"),
    }
    assert_eq!(model.lock().unwrap().read_count(DmReg::Dctrl), 5);

    // wake_dm surfaces the same timeout.
    let err = backend.wake_dm().unwrap_err();
    assert_eq!(err.code(), -2);
}

#[test]
fn gpr_roundtrip_and_x0() {
    let (mut backend, _) = setup_halted();

    for (num, value) in [(1u32, 0xDEAD_BEEFu32), (5, 0x1234_5678), (31, 1)] {
        backend.write_gpr(num, value).unwrap();
        assert_eq!(backend.read_gpr(num).unwrap(), value);
    }

    backend.write_gpr(0, 0x5555_5555).unwrap();
    assert_eq!(backend.read_gpr(0).unwrap(), 0);

    assert_eq!(backend.read_gpr(32).unwrap_err().code(), -4);
}

#[test]
fn csr_roundtrip_preserves_t0() {
    let (mut backend, model) = setup_halted();
    {
        let mut m = model.lock().unwrap();
        m.warps[0].gprs[5] = 0x0BAD_F00D; // t0 has user state
        m.warps[0].csrs.insert(0x340, 0x77);
    }

    assert_eq!(backend.read_csr(0x340).unwrap(), 0x77);
    backend.write_csr(0x340, 0xABCD).unwrap();
    assert_eq!(backend.read_csr(0x340).unwrap(), 0xABCD);

    // The scratch register came back intact.
    assert_eq!(model.lock().unwrap().warps[0].gprs[5], 0x0BAD_F00D);
    assert_eq!(backend.read_gpr(5).unwrap(), 0x0BAD_F00D);
}

#[test]
fn named_register_access() {
    let (mut backend, _) = setup_halted();

    backend.write_register("x7", 42).unwrap();
    assert_eq!(backend.read_register("x7").unwrap(), 42);

    backend.write_register("mscratch", 7).unwrap();
    assert_eq!(backend.read_register("mscratch").unwrap(), 7);

    backend.write_register("pc", 0x8000_0010).unwrap();
    assert_eq!(backend.read_register("pc").unwrap(), 0x8000_0010);

    assert_eq!(backend.read_register("xyzzy").unwrap_err().code(), -4);
    assert_eq!(
        backend
            .write_registers(&["x1", "x2"], &[1])
            .unwrap_err()
            .code(),
        -4
    );

    let values = backend.read_registers(&["x7", "pc"]).unwrap();
    assert_eq!(values, vec![42, 0x8000_0010]);
}

#[test]
fn state_access_requires_selection_and_halt() {
    let (mut backend, _) = setup(1, 1, 4, 2);

    // Nothing selected yet.
    assert_eq!(backend.read_gpr(1).unwrap_err().code(), -8);

    // Selected but running.
    backend.halt_all_warps().unwrap();
    backend.select_warp_thread(2, 1).unwrap();
    backend.resume_all_warps().unwrap();
    assert_eq!(backend.read_gpr(1).unwrap_err().code(), -9);
}

#[test]
fn halt_and_resume_subsets() {
    let (mut backend, model) = setup(1, 1, 4, 0);

    backend.halt_warps(&[1, 3]).unwrap();
    {
        let m = model.lock().unwrap();
        assert!(!m.warps[0].halted);
        assert!(m.warps[1].halted);
        assert!(!m.warps[2].halted);
        assert!(m.warps[3].halted);
        assert_eq!(m.warps[1].hacause, 2);
    }

    let summary = backend.warp_summary().unwrap();
    assert!(summary.any_halted && !summary.all_halted);
    assert!(summary.any_running && !summary.all_running);

    backend.resume_warps(&[1]).unwrap();
    assert!(!model.lock().unwrap().warps[1].halted);
    assert!(backend.warp_state(3).unwrap());

    // Out-of-range warp IDs are skipped, not fatal.
    backend.halt_warps(&[99]).unwrap();
}

#[test]
fn warp_status_restores_selection() {
    let (mut backend, model) = setup(1, 1, 4, 2);
    backend.halt_all_warps().unwrap();
    backend.select_warp_thread(3, 1).unwrap();
    model.lock().unwrap().warps[2].pc = 0xCAFE_0000;

    let status = backend.warp_status(true, true).unwrap();
    assert_eq!(status.len(), 4);
    assert_eq!(status[&2].pc, Some(0xCAFE_0000));
    assert_eq!(status[&2].hacause, Some(HaltCause::HaltRequested));
    assert!(status.values().all(|s| s.active && s.halted));

    // The scan walked other warps but put the selection back.
    let m = model.lock().unwrap();
    let dselect = m
        .log
        .iter()
        .rev()
        .find_map(|a| match a {
            Access::Write(addr, v) if *addr == DmReg::Dselect.addr() => Some(*v),
            _ => None,
        })
        .unwrap();
    assert_eq!(dm::extract(DmReg::Dselect, "warpsel", dselect).unwrap(), 3);
    drop(m);
    assert_eq!(backend.selected_warp_thread(true).unwrap(), Some((3, 1)));
}

#[test]
fn selection_validates_ranges() {
    let (mut backend, _) = setup(1, 1, 4, 1);
    assert_eq!(backend.select_warp_thread(4, 0).unwrap_err().code(), -4);
    assert_eq!(backend.select_warp_thread(0, 2).unwrap_err().code(), -4);
    backend.halt_all_warps().unwrap();
    backend.select_warp_thread(0, 1).unwrap();
}

#[test]
fn bulk_selection_is_idempotent() {
    let (mut backend, model) = setup(1, 5, 8, 0); // 40 warps -> 2 windows
    backend.select_all_warps(true).unwrap();
    backend.select_all_warps(true).unwrap();

    // Both windows carry a full mask afterwards.
    backend.dm_write_field(DmReg::Dselect, "winsel", 0).unwrap();
    assert_eq!(backend.dm_read(DmReg::Wmask).unwrap(), 0xFFFF_FFFF);
    backend.dm_write_field(DmReg::Dselect, "winsel", 1).unwrap();
    assert_eq!(backend.dm_read(DmReg::Wmask).unwrap(), 0xFFFF_FFFF);

    // Warps in the second window are reachable.
    backend.halt_warps(&[39]).unwrap();
    assert!(model.lock().unwrap().warps[39].halted);
}

#[test]
fn reset_platform_with_halt() {
    let (mut backend, model) = setup(1, 1, 4, 0);
    backend.halt_all_warps().unwrap();
    backend.select_warp_thread(0, 0).unwrap();

    backend.reset_platform(true).unwrap();

    let m = model.lock().unwrap();
    assert!(m.warps.iter().all(|w| w.halted));
    assert!(m.warps.iter().all(|w| w.hacause == 4));
    drop(m);

    // Selection is gone after reset; state access says so.
    assert_eq!(backend.read_gpr(1).unwrap_err().code(), -8);
}

#[test]
fn injection_fault_is_reported() {
    let (mut backend, model) = setup_halted();
    model.lock().unwrap().fail_inject = true;
    backend.set_poll_policy(3, Duration::from_millis(1));

    let err = backend.inject(assembly::addi(1, 0, 1)).unwrap_err();
    assert_eq!(err.code(), -1);
}

#[test]
fn inject_executes_on_selected_warp() {
    let (mut backend, model) = setup_halted();
    backend.inject(assembly::addi(9, 0, 123)).unwrap();
    assert_eq!(model.lock().unwrap().warps[0].gprs[9], 123);
}
