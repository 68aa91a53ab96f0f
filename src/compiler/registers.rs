//! Per-function register allocation.
//!
//! Every function gets a fresh frame layout: register 0 is the return
//! slot, register 1 the implicit receiver when there is one, then the
//! parameters and pre-scanned locals in a contiguous ascending range.
//! Temporaries live strictly above that range and are handed out by a
//! linear scan; calls stage their arguments through contiguous blocks.

use std::collections::HashMap;

/// Hard frame limit: operands are single bytes.
const MAX_REGISTERS: usize = 256;

#[derive(Debug)]
pub struct RegisterAllocator {
    by_name: HashMap<String, u8>,
    allocated: [bool; MAX_REGISTERS],
    first_temporary: usize,
    /// One past the highest register touched; reported as the frame size.
    high_water: usize,
    has_receiver: bool,
    param_count: usize,
}

impl Default for RegisterAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterAllocator {
    pub fn new() -> Self {
        Self {
            by_name: HashMap::new(),
            allocated: [false; MAX_REGISTERS],
            first_temporary: 1,
            high_water: 1,
            has_receiver: false,
            param_count: 0,
        }
    }

    /// Reset all state and lay out the frame for one function. Parameters
    /// and locals must be the validator's pre-scanned lists.
    pub fn setup_function(
        &mut self,
        params: &[String],
        locals: &[String],
        has_receiver: bool,
    ) -> Result<(), String> {
        self.by_name.clear();
        self.allocated = [false; MAX_REGISTERS];
        self.has_receiver = has_receiver;
        self.param_count = params.len();

        // Register 0 is the return slot, never a variable.
        self.allocated[0] = true;
        let mut next = 1usize;
        if has_receiver {
            self.allocated[next] = true;
            next += 1;
        }
        for name in params.iter().chain(locals.iter()) {
            if next >= MAX_REGISTERS {
                return Err(format!(
                    "function frame overflow: more than {} registers of parameters and locals",
                    MAX_REGISTERS
                ));
            }
            if self
                .by_name
                .insert(name.clone(), next as u8)
                .is_some()
            {
                return Err(format!("duplicate binding '{}' in function frame", name));
            }
            self.allocated[next] = true;
            next += 1;
        }
        self.first_temporary = next;
        self.high_water = next;
        Ok(())
    }

    /// The register pre-assigned to a declared parameter or local. An
    /// unknown name means the pre-scan contract was violated upstream.
    pub fn variable(&self, name: &str) -> Result<u8, String> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| format!("reference to undeclared variable '{}'", name))
    }

    /// The implicit receiver register, if this frame has one.
    pub fn receiver(&self) -> Option<u8> {
        if self.has_receiver { Some(1) } else { None }
    }

    pub fn first_temporary(&self) -> usize {
        self.first_temporary
    }

    /// Allocate the lowest free temporary register.
    pub fn allocate_temporary(&mut self) -> Result<u8, String> {
        for reg in self.first_temporary..MAX_REGISTERS {
            if !self.allocated[reg] {
                self.allocated[reg] = true;
                self.high_water = self.high_water.max(reg + 1);
                return Ok(reg as u8);
            }
        }
        Err("register frame overflow: no free temporary register".to_string())
    }

    /// Free a temporary. Only currently-allocated registers at or above
    /// the temporary boundary may be freed.
    pub fn free(&mut self, reg: u8) -> Result<(), String> {
        let reg = reg as usize;
        if reg < self.first_temporary {
            return Err(format!(
                "cannot free register r{}: below the temporary boundary",
                reg
            ));
        }
        if !self.allocated[reg] {
            return Err(format!("cannot free register r{}: not allocated", reg));
        }
        self.allocated[reg] = false;
        Ok(())
    }

    /// Allocate `n` consecutive free registers for call-argument staging;
    /// returns the first register of the block.
    pub fn allocate_contiguous(&mut self, n: usize) -> Result<u8, String> {
        if n == 0 {
            return Err("cannot allocate an empty register block".to_string());
        }
        let mut start = self.first_temporary;
        while start + n <= MAX_REGISTERS {
            match (start..start + n).find(|&reg| self.allocated[reg]) {
                Some(occupied) => start = occupied + 1,
                None => {
                    for reg in start..start + n {
                        self.allocated[reg] = true;
                    }
                    self.high_water = self.high_water.max(start + n);
                    return Ok(start as u8);
                }
            }
        }
        Err(format!(
            "register frame overflow: no room for a block of {} registers",
            n
        ))
    }

    /// Free a block previously returned by `allocate_contiguous`.
    pub fn free_contiguous(&mut self, start: u8, n: usize) -> Result<(), String> {
        for reg in (start as usize)..(start as usize + n) {
            self.free(reg as u8)?;
        }
        Ok(())
    }

    /// Frame size the callee consumes.
    pub fn total_registers(&self) -> usize {
        self.high_water
    }
}
