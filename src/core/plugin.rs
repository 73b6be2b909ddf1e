//! Interpreter event fan-out.
//!
//! The interpreter raises events on [`CorePlugin`], which forwards them to
//! every registered listener in registration order. A listener that unwinds
//! stops the fan-out; the remaining listeners do not see the event.

use crate::core::executor::Executor;
use crate::core::manager::StateManager;
use crate::core::types::{Flow, ProcessId, StateId};
use log::debug;
use std::cell::RefCell;
use std::rc::Rc;

pub trait Plugin {
    fn name(&self) -> &'static str;

    fn on_timer(&mut self, _exec: &mut dyn Executor) -> Flow<()> {
        Ok(())
    }

    fn on_new_block_covered(
        &mut self,
        _exec: &mut dyn Executor,
        _state: StateId,
        _pc: u64,
    ) -> Flow<()> {
        Ok(())
    }

    fn on_custom_instruction(
        &mut self,
        _exec: &mut dyn Executor,
        _state: StateId,
        _opcode: u64,
    ) -> Flow<()> {
        Ok(())
    }

    fn on_process_fork(&mut self, _pre_fork: bool, _is_child: bool, _parent: ProcessId) {}
}

impl Plugin for StateManager {
    fn name(&self) -> &'static str {
        "StateManager"
    }

    fn on_timer(&mut self, exec: &mut dyn Executor) -> Flow<()> {
        StateManager::on_timer(self, exec)
    }

    fn on_new_block_covered(
        &mut self,
        _exec: &mut dyn Executor,
        _state: StateId,
        pc: u64,
    ) -> Flow<()> {
        StateManager::on_new_block_covered(self, pc);
        Ok(())
    }

    fn on_custom_instruction(
        &mut self,
        exec: &mut dyn Executor,
        state: StateId,
        opcode: u64,
    ) -> Flow<()> {
        StateManager::on_custom_instruction(self, exec, state, opcode)
    }

    fn on_process_fork(&mut self, pre_fork: bool, is_child: bool, parent: ProcessId) {
        StateManager::on_process_fork(self, pre_fork, is_child, parent)
    }
}

/// Registry of listeners for interpreter events.
#[derive(Default)]
pub struct CorePlugin {
    plugins: Vec<Rc<RefCell<dyn Plugin>>>,
}

impl CorePlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Rc<RefCell<dyn Plugin>>) {
        debug!("Registering plugin {}", plugin.borrow().name());
        self.plugins.push(plugin);
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn on_timer(&self, exec: &mut dyn Executor) -> Flow<()> {
        for plugin in &self.plugins {
            plugin.borrow_mut().on_timer(exec)?;
        }
        Ok(())
    }

    pub fn on_new_block_covered(
        &self,
        exec: &mut dyn Executor,
        state: StateId,
        pc: u64,
    ) -> Flow<()> {
        for plugin in &self.plugins {
            plugin.borrow_mut().on_new_block_covered(exec, state, pc)?;
        }
        Ok(())
    }

    pub fn on_custom_instruction(
        &self,
        exec: &mut dyn Executor,
        state: StateId,
        opcode: u64,
    ) -> Flow<()> {
        for plugin in &self.plugins {
            plugin.borrow_mut().on_custom_instruction(exec, state, opcode)?;
        }
        Ok(())
    }

    pub fn on_process_fork(&self, pre_fork: bool, is_child: bool, parent: ProcessId) {
        for plugin in &self.plugins {
            plugin.borrow_mut().on_process_fork(pre_fork, is_child, parent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Unwind;
    use crate::core::opcodes::OpcodeLayout;
    use crate::testing::interpreter::SimulatedInterpreter;
    use crate::testing::program::Program;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        blocks: Vec<u64>,
        unwind_on_custom: bool,
        customs: usize,
    }

    impl Plugin for Recorder {
        fn name(&self) -> &'static str {
            "Recorder"
        }

        fn on_new_block_covered(
            &mut self,
            _exec: &mut dyn Executor,
            _state: StateId,
            pc: u64,
        ) -> Flow<()> {
            self.blocks.push(pc);
            Ok(())
        }

        fn on_custom_instruction(
            &mut self,
            _exec: &mut dyn Executor,
            _state: StateId,
            _opcode: u64,
        ) -> Flow<()> {
            self.customs += 1;
            if self.unwind_on_custom {
                return Err(Unwind::CpuExit);
            }
            Ok(())
        }
    }

    #[test]
    fn test_events_reach_every_listener() {
        let mut interp = SimulatedInterpreter::new(0, Arc::new(Program::idle(OpcodeLayout::X86)));
        let state = interp.spawn_state();
        let first = Rc::new(RefCell::new(Recorder::default()));
        let second = Rc::new(RefCell::new(Recorder::default()));

        let mut core = CorePlugin::new();
        core.register(first.clone());
        core.register(second.clone());
        assert_eq!(core.len(), 2);

        core.on_new_block_covered(&mut interp, state, 0x10).unwrap();
        assert_eq!(first.borrow().blocks, vec![0x10]);
        assert_eq!(second.borrow().blocks, vec![0x10]);
    }

    #[test]
    fn test_unwind_stops_fan_out() {
        let mut interp = SimulatedInterpreter::new(0, Arc::new(Program::idle(OpcodeLayout::X86)));
        let state = interp.spawn_state();
        let first = Rc::new(RefCell::new(Recorder {
            unwind_on_custom: true,
            ..Default::default()
        }));
        let second = Rc::new(RefCell::new(Recorder::default()));

        let mut core = CorePlugin::new();
        core.register(first.clone());
        core.register(second.clone());

        assert_eq!(
            core.on_custom_instruction(&mut interp, state, 0),
            Err(Unwind::CpuExit)
        );
        assert_eq!(first.borrow().customs, 1);
        assert_eq!(second.borrow().customs, 0);
    }
}
