//! Demonstrates the lifecycle of a shared scope: allocating memory, accessing it from several
//! threads, being rejected while in use and finally closing.

use std::thread;

use resource_scope::{ResourceScope, ScopeError, SegmentAllocator};

fn main() {
    let scope = ResourceScope::shared();
    scope
        .add_close_action(|| println!("close action ran"))
        .unwrap();

    let region = scope.allocate(4, 4).unwrap();

    thread::scope(|s| {
        for index in 0..4_u8 {
            let region = &region;
            s.spawn(move || region.set_u8(usize::from(index), index * 10).unwrap());
        }
    });

    for offset in 0..region.byte_size() {
        println!("byte {offset}: {}", region.get_u8(offset).unwrap());
    }

    let handle = scope.acquire().unwrap();

    match scope.close() {
        Err(ScopeError::StillAcquired { count }) => {
            println!("close rejected: {count} handle(s) outstanding");
        }
        other => println!("unexpected close result: {other:?}"),
    }

    handle.release();
    scope.close().unwrap();

    println!("after close, read fails with: {:?}", region.get_u8(0));
}
