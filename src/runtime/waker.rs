use std::cell::RefCell;
use std::collections::VecDeque;
use std::task::{RawWaker, RawWakerVTable, Waker};

use crate::runtime::TaskId;

thread_local! {
    /// Thread-local queue of task ids woken via their [`Waker`]s. The event
    /// loop drains it into its own ready queue between polls.
    pub(crate) static WOKEN_QUEUE: RefCell<VecDeque<TaskId>> =
        const { RefCell::new(VecDeque::new()) };
}

/// Create a [`Waker`] for the given root task.
///
/// Waking pushes the task id onto the thread-local woken queue. Zero
/// allocation: the id is encoded as a raw pointer (usize cast).
///
/// # Safety
///
/// Must only be used on the thread driving the event loop; wakers never
/// leave it because the runtime is single-threaded.
pub(crate) fn task_waker(task: TaskId) -> Waker {
    let data = task.0 as usize as *const ();
    // SAFETY: the vtable functions below follow the RawWaker contract. The
    // data is just a usize (task id) cast to a pointer, so there is no
    // heap allocation and no lifetime concern.
    unsafe { Waker::from_raw(RawWaker::new(data, &VTABLE)) }
}

const VTABLE: RawWakerVTable = RawWakerVTable::new(clone_fn, wake_fn, wake_by_ref_fn, drop_fn);

unsafe fn clone_fn(data: *const ()) -> RawWaker {
    RawWaker::new(data, &VTABLE)
}

unsafe fn wake_fn(data: *const ()) {
    // SAFETY: wake_by_ref_fn is safe to call with data from our vtable.
    unsafe { wake_by_ref_fn(data) };
}

unsafe fn wake_by_ref_fn(data: *const ()) {
    let task = TaskId(data as usize as u32);
    WOKEN_QUEUE.with(|queue| {
        queue.borrow_mut().push_back(task);
    });
}

unsafe fn drop_fn(_data: *const ()) {
    // No resources to free; data is just a usize.
}

/// Drain the thread-local woken queue into the provided buffer.
pub(crate) fn drain_woken(buf: &mut VecDeque<TaskId>) {
    WOKEN_QUEUE.with(|queue| {
        buf.append(&mut queue.borrow_mut());
    });
}
