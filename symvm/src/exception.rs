//! Exception resolution and frame unwinding.
//!
//! A raised exception is matched against the current frame's exception
//! table and, failing that, against each caller in turn. Frame pops
//! during unwinding go through the trail like any other mutation, so a
//! later backtrack replays the unwinding in reverse. When a caller frame
//! catches, its coverage pc is reverted to the call site so the recorded
//! edge leaves the instruction that actually let the exception in, not a
//! pc left over from a deeper (possibly recursive) activation.

use bytecode::prelude::*;
use tracing::{debug, trace};

use crate::coverage::CoverageSink;
use crate::executor::PathOutcome;
use crate::state::VmState;
use crate::term::Term;
use crate::heap::ObjRef;
use crate::Result;

/// Raises an exception of `class` at the current pc.
///
/// Returns `None` when a handler was found (the state is positioned at
/// the handler with the exception object pushed), or the terminal
/// outcome when the exception left the outermost frame.
pub fn raise(
    state: &mut VmState<'_>,
    coverage: &mut dyn CoverageSink,
    class: ClassId,
    object: Option<ObjRef>,
) -> Result<Option<PathOutcome>> {
    let class_name = state.project.class(class)?.name.clone();
    debug!("raising {class_name}");

    let object = match object {
        Some(o) => o,
        None => {
            let fields = state
                .project
                .class(class)?
                .fields
                .iter()
                .map(|f| Term::Value(Value::default_of(&f.ty)))
                .collect();
            state.alloc_object(class, fields)
        }
    };

    let mut unwound_frames = false;
    loop {
        if state.depth() == 0 {
            return Ok(Some(PathOutcome::Uncaught { class, name: class_name }));
        }
        let frame = state.frame()?;
        let method_id = frame.method;
        let method = state.project.method(method_id)?;

        // In the throwing frame the pc is the faulting instruction; a
        // caller frame sits on its return address, so the covering
        // region is looked up at the call site.
        let site_pc = if unwound_frames { frame.last_pc } else { frame.pc };

        let handler = method.handlers.iter().find(|entry| {
            let in_range = site_pc >= entry.start_pc && site_pc < entry.end_pc;
            let type_matches = match entry.catch_type {
                None => true,
                Some(catch) => state.project.is_assignable(class, catch),
            };
            in_range && type_matches
        });

        match handler {
            Some(entry) => {
                let handler_pc = entry.handler_pc;
                trace!(
                    "{} handles {class_name} at pc {handler_pc}",
                    method.name
                );
                if state.mode == crate::ExecutionMode::Symbolic {
                    coverage.exception_unwind(method_id, site_pc, Some(handler_pc));
                }
                if unwound_frames {
                    // Coverage edges must leave the call site, not
                    // whatever pc an inner activation recorded last.
                    let top = state.depth() - 1;
                    state.revert_last_pc(top, site_pc);
                }
                // The handler starts from a clean operand stack holding
                // only the exception.
                while state.frame()?.stack_depth() > 0 {
                    state.pop_operand()?;
                }
                state.push_operand(Term::Ref(object), SlotWidth::Single)?;
                state.set_pc(handler_pc)?;
                return Ok(None);
            }
            None => {
                if state.mode == crate::ExecutionMode::Symbolic {
                    coverage.exception_unwind(method_id, site_pc, None);
                }
                state.pop_frame()?;
                unwound_frames = true;
            }
        }
    }
}
