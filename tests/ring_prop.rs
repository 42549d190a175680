//! Property and scenario tests for the ring-buffer invariants.

use hicocan::layout::buffer_vars_offset as off;
use hicocan::mmio::DpmWindow;
use hicocan::ring::{Direction, RingHandle};
use proptest::prelude::*;
use std::sync::Arc;

const VARS_OFFSET: usize = 0;
const SLOT_BASE: usize = 16;
const FRAME_SIZE: usize = 18;

fn make_ring(size: u16) -> (Arc<DpmWindow>, RingHandle) {
    let buf_size = SLOT_BASE + size as usize * FRAME_SIZE;
    let mem = vec![0u8; buf_size].into_boxed_slice();
    let ptr = Box::into_raw(mem) as *mut u8;
    let dpm = Arc::new(unsafe { DpmWindow::new(ptr, buf_size) });
    dpm.write_u16(VARS_OFFSET + off::BASE, SLOT_BASE as u16).unwrap();
    dpm.write_u16(VARS_OFFSET + off::WPTR, 0).unwrap();
    dpm.write_u16(VARS_OFFSET + off::RPTR, 0).unwrap();
    dpm.write_u16(VARS_OFFSET + off::SIZE, size).unwrap();
    let ring = RingHandle::new(dpm.clone(), VARS_OFFSET, Direction::Tx).unwrap();
    (dpm, ring)
}

#[test]
fn fresh_ring_is_empty_not_full() {
    let (_dpm, ring) = make_ring(8);
    assert!(ring.is_empty().unwrap());
    assert!(!ring.is_full().unwrap());
    assert_eq!(ring.count().unwrap(), 0);
    assert_eq!(ring.capacity().unwrap(), 7);
}

#[test]
fn filling_to_capacity_reports_full() {
    let (_dpm, ring) = make_ring(4);
    for _ in 0..ring.capacity().unwrap() {
        ring.advance_write().unwrap();
    }
    assert!(ring.is_full().unwrap());
    assert!(!ring.is_empty().unwrap());
    assert_eq!(ring.count().unwrap(), 3);
}

#[test]
fn advance_write_on_full_ring_errors() {
    let (_dpm, ring) = make_ring(2);
    ring.advance_write().unwrap();
    assert!(ring.is_full().unwrap());
    assert!(ring.advance_write().is_err());
}

#[test]
fn advance_read_on_empty_ring_errors() {
    let (_dpm, ring) = make_ring(4);
    assert!(ring.advance_read().is_err());
}

#[test]
fn wraparound_preserves_count() {
    let (_dpm, ring) = make_ring(4);
    ring.advance_write().unwrap();
    ring.advance_write().unwrap();
    ring.advance_read().unwrap();
    ring.advance_write().unwrap();
    ring.advance_write().unwrap();
    assert!(ring.is_full().unwrap());
    assert_eq!(ring.count().unwrap(), 3);
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Write,
    Read,
}

proptest! {
    #![proptest_config(ProptestConfig { failure_persistence: None, ..ProptestConfig::default() })]

    #[test]
    fn ring_matches_reference_model(
        size in 2u16..32,
        ops in prop::collection::vec(prop_oneof![Just(Op::Write), Just(Op::Read)], 0..200),
    ) {
        let (_dpm, ring) = make_ring(size);
        let capacity = (size - 1) as usize;
        let mut model: usize = 0;

        for op in ops {
            match op {
                Op::Write => {
                    if model < capacity {
                        ring.advance_write().unwrap();
                        model += 1;
                    } else {
                        prop_assert!(ring.is_full().unwrap());
                        prop_assert!(ring.advance_write().is_err());
                    }
                }
                Op::Read => {
                    if model > 0 {
                        ring.advance_read().unwrap();
                        model -= 1;
                    } else {
                        prop_assert!(ring.is_empty().unwrap());
                        prop_assert!(ring.advance_read().is_err());
                    }
                }
            }
            prop_assert_eq!(ring.count().unwrap(), model);
            prop_assert_eq!(ring.is_empty().unwrap(), model == 0);
            prop_assert_eq!(ring.is_full().unwrap(), model == capacity);
        }
    }
}
