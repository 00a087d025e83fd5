/// Declare a task.
///
/// ```ignore
/// task! {
///     rt, blas::gemm,
///     map: (i, j);          // mapping arguments, the task ID when omitted
///     args: (alpha, op);    // passed by value, before the handles
///     R: a, b;              // read handles, passed as `&T`
///     RW: c;                // read-write handles, passed as `&mut T`
/// }
/// ```
///
/// Every worker must reach every `task!` of a region in the same order. The worker owning the
/// task waits for its handles and runs it, the others only record the accesses.
#[macro_export]
macro_rules! task {
    // Mapping on custom arguments.
    (@next $rt:ident, $map:expr) => {
        $rt.next_task_args($map)
    };

    // Mapping on the task ID.
    (@next $rt:ident) => {
        $rt.next_task()
    };

    (
        $rt:ident, $fun:path,
        $(map: $map:expr;)?
        $(args: ($($arg:expr),* $(,)?);)?
        $(R: $($read:ident),+;)?
        $(RW: $($write:ident),+;)?
    ) => {
        unsafe {
            let (_task_id, ownership) = $crate::task!(@next $rt $(, $map)?);
            match ownership {
                $crate::TaskOwnership::Owner => {
                    $($(let $read = $read.get_read();)+)?
                    $($(let mut $write = $write.get_write(_task_id);)+)?
                    $fun($($($arg,)*)? $($(&*$read,)+)? $($(&mut *$write,)+)?);
                }
                $crate::TaskOwnership::NotOwner => {
                    $($($read.declare_read();)+)?
                    $($($write.declare_write(_task_id);)+)?
                }
            }
        }
    };
}
