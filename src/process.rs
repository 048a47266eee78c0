//! 执行者标识
//!
//! 锁需要记录持有者以检测重入与越权释放。
//! 此处以线程代替 CPU / 进程，为每个线程分配一个非零编号。

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 表示“无持有者”的编号
pub const NO_HOLDER: usize = 0;

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static MY_ID: Cell<usize> = Cell::new(NO_HOLDER);
}

/// 返回当前线程的编号，首次调用时分配。
///
/// 编号在进程生命周期内唯一，且从不等于 [`NO_HOLDER`]。
pub fn my_id() -> usize {
    MY_ID.with(|id| {
        if id.get() == NO_HOLDER {
            id.set(NEXT_ID.fetch_add(1, Ordering::Relaxed));
        }
        id.get()
    })
}
