//! Out-of-order guard release is a fatal logic error.
//!
//! Kept in its own test binary: the panic leaves the simulated core at a
//! nonzero level, which would confuse any later test in the same process.
use keryx_kernel::ipl::IplGuard;
use keryx_port_std::{with_core, StdPort};

#[test]
#[should_panic = "out of order"]
fn out_of_order_release_panics() {
    with_core(|| {
        let g2 = IplGuard::<StdPort, 2>::raise();
        let _g5 = IplGuard::<StdPort, 5>::raise();
        drop(g2);
    });
}
