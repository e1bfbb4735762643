//! # Register context
//!
//! Snapshot of the register file taken by generated code. Every register owns one fixed-size cell
//! at a stable address: bridge code stores the live register into its cell when saving and loads
//! it back when restoring, so writing a cell between the two changes the register the hooked
//! function sees.

use std::cell::UnsafeCell;
use std::{fmt, mem, ptr};

use super::Register;

/// Size of a single register cell in bytes
pub const CELL_SIZE: usize = 16;

/// Storage for one register
#[repr(C, align(16))]
#[derive(Clone, Copy)]
struct Slot([u8; CELL_SIZE]);

/// Register snapshot shared between generated code and callbacks
///
/// The cells are overwritten by every call that passes through the owning hook, so references
/// obtained from a context must not outlive the callback that obtained them.
pub struct RegisterContext {
    /// One cell per [`Register`], indexed by [`Register::index`]
    slots: Box<[UnsafeCell<Slot>]>,
}

// Safety: the cells are plain bytes that generated code and callbacks access through raw pointers;
// every access goes through `unsafe` accessors whose callers uphold the single-writer discipline of a call
unsafe impl Send for RegisterContext {}
unsafe impl Sync for RegisterContext {}

impl RegisterContext {
    /// Creates a zeroed context
    pub fn new() -> Self {
        let slots = Register::ALL
            .iter()
            .map(|_| UnsafeCell::new(Slot([0; CELL_SIZE])))
            .collect();
        Self { slots }
    }

    /// Address of the first cell
    pub fn base(&self) -> usize {
        self.slots.as_ptr() as usize
    }

    /// Offset of a register's cell from [`RegisterContext::base`]
    pub const fn offset_of(register: Register) -> usize {
        register.index() * mem::size_of::<Slot>()
    }

    /// Cell of a register
    pub fn cell(&self, register: Register) -> RegisterCell<'_> {
        RegisterCell {
            register,
            slot: &self.slots[register.index()],
        }
    }

    /// Address of a register's cell
    pub fn address_of(&self, register: Register) -> *mut u8 {
        self.cell(register).address()
    }

    /// Reads the saved value of a register as a pointer-sized integer
    pub fn read(&self, register: Register) -> usize {
        // Safety: every cell is initialized and wider than usize
        unsafe { self.cell(register).get::<usize>() }
    }
}

impl Default for RegisterContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RegisterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterContext")
            .field("base", &format_args!("{:#x}", self.base()))
            .finish()
    }
}

/// Accessor for the saved value of a single register
#[derive(Clone, Copy)]
pub struct RegisterCell<'a> {
    /// Register the cell belongs to
    register: Register,
    /// Backing storage
    slot: &'a UnsafeCell<Slot>,
}

impl<'a> RegisterCell<'a> {
    /// Register the cell belongs to
    pub fn register(&self) -> Register {
        self.register
    }

    /// Width of the register in bytes
    pub fn size(&self) -> usize {
        self.register.size()
    }

    /// Address generated code stores the register to
    pub fn address(&self) -> *mut u8 {
        self.slot.get().cast()
    }

    /// Reads the saved value
    ///
    /// # Panics
    ///
    /// Panics if `T` is larger than a cell.
    ///
    /// # Safety
    ///
    /// `T` must be valid for any bit pattern, and no other thread may be saving into this context
    pub unsafe fn get<T: Copy>(&self) -> T {
        assert!(mem::size_of::<T>() <= CELL_SIZE, "value larger than a register cell");
        ptr::read_unaligned(self.address().cast())
    }

    /// Overwrites the saved value, which is loaded into the register when the context is restored
    ///
    /// # Panics
    ///
    /// Panics if `T` is larger than a cell.
    ///
    /// # Safety
    ///
    /// No other thread may be saving into this context
    pub unsafe fn set<T: Copy>(&self, value: T) {
        assert!(mem::size_of::<T>() <= CELL_SIZE, "value larger than a register cell");
        ptr::write_unaligned(self.address().cast(), value)
    }

    /// Treats the saved value as a pointer and reads the `T` at `offset` bytes past it
    ///
    /// # Safety
    ///
    /// The saved value plus `offset` must point to readable memory holding a valid `T`
    pub unsafe fn pointer_value<T: Copy>(&self, offset: usize) -> T {
        let address = self.get::<usize>().wrapping_add(offset);
        ptr::read_unaligned(address as *const T)
    }

    /// Treats the saved value as a pointer and writes `value` at `offset` bytes past it
    ///
    /// # Safety
    ///
    /// The saved value plus `offset` must point to memory writable as a `T`
    pub unsafe fn set_pointer_value<T: Copy>(&self, offset: usize, value: T) {
        let address = self.get::<usize>().wrapping_add(offset);
        ptr::write_unaligned(address as *mut T, value)
    }
}

impl fmt::Debug for RegisterCell<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Safety: every cell is initialized
        let bytes = unsafe { (*self.slot.get()).0 };
        f.debug_struct("RegisterCell")
            .field("register", &self.register)
            .field("value", &&bytes[..self.size()])
            .finish()
    }
}
