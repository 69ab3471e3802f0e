//! Integration tests that build and run real thunks.

use curry_jit::{Curried, CurryError, MAX_ARGS, curry, vcurry};
use std::arch::global_asm;
use std::sync::Mutex;
use std::thread;

// Returns the stack pointer as seen on entry, i.e. right after the call.
global_asm!(
    ".globl curry_jit_test_entry_rsp",
    ".type curry_jit_test_entry_rsp, @function",
    "curry_jit_test_entry_rsp:",
    "mov rax, rsp",
    "ret",
);

// Records the six argument registers and the next 58 stack words into
// RECORD, which is enough for 64 arguments.
static mut RECORD: [u64; 64] = [0; 64];

global_asm!(
    ".globl curry_jit_test_record",
    ".type curry_jit_test_record, @function",
    "curry_jit_test_record:",
    "lea r11, [rip + {buf}]",
    "mov [r11], rdi",
    "mov [r11 + 8], rsi",
    "mov [r11 + 16], rdx",
    "mov [r11 + 24], rcx",
    "mov [r11 + 32], r8",
    "mov [r11 + 40], r9",
    "lea r10, [rsp + 8]",
    "xor ecx, ecx",
    "2:",
    "mov rax, [r10 + rcx * 8]",
    "mov [r11 + rcx * 8 + 48], rax",
    "inc rcx",
    "cmp rcx, 58",
    "jb 2b",
    "mov eax, 0xff",
    "ret",
    buf = sym RECORD,
);

unsafe extern "C" {
    fn curry_jit_test_entry_rsp() -> u64;
    fn curry_jit_test_record() -> u64;
}

static RECORDER: Mutex<()> = Mutex::new(());

fn recorder() -> *const () {
    curry_jit_test_record as *const ()
}

fn recorded() -> [u64; 64] {
    unsafe { std::ptr::read_volatile(&raw const RECORD) }
}

/// Distinct words that between them need every immediate width.
fn word(i: usize) -> u64 {
    match i % 4 {
        0 => i as u64,
        1 => 0xFFFF_0000 | i as u64,
        2 => (-(i as i64) - 0x1000) as u64,
        _ => 0x0123_4567_0000_0000 | i as u64,
    }
}

extern "C" fn sub2(a: u64, b: u64) -> u64 {
    a.wrapping_sub(b).wrapping_add(0x100)
}

#[rustfmt::skip]
extern "C" fn check8(
    a0: u64, a1: u64, a2: u64, a3: u64, a4: u64, a5: u64, a6: u64, a7: u64,
) -> u64 {
    [a0, a1, a2, a3, a4, a5, a6, a7]
        .iter()
        .fold(0, |acc, &x| acc.wrapping_mul(131).wrapping_add(x))
}

#[rustfmt::skip]
extern "C" fn check16(
    a0: u64, a1: u64, a2: u64, a3: u64, a4: u64, a5: u64, a6: u64, a7: u64,
    a8: u64, a9: u64, aa: u64, ab: u64, ac: u64, ad: u64, ae: u64, af: u64,
) -> u64 {
    let args = [a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, aa, ab, ac, ad, ae, af];
    if args.iter().enumerate().all(|(i, &a)| a == i as u64) {
        0xff
    } else {
        0
    }
}

extern "C" fn echo(a: u64) -> u64 {
    a
}

#[test]
fn test_two_args_one_now() {
    let curried = unsafe { curry(sub2 as *const (), 1, &[0x0]) }.unwrap();
    assert!(curried.is_thunk());
    assert_eq!(curried.call(&[0x1]), sub2(0x0, 0x1));
}

#[test]
fn test_all_later_is_identity() {
    let curried = unsafe { curry(sub2 as *const (), 2, &[]) }.unwrap();
    assert_eq!(curried.as_ptr(), sub2 as *const ());
    assert_eq!(curried.call(&[7, 5]), sub2(7, 5));
}

#[test]
fn test_all_now() {
    let curried = unsafe { curry(sub2 as *const (), 0, &[9, 4]) }.unwrap();
    assert_eq!(curried.arity(), 0);
    assert_eq!(curried.call(&[]), sub2(9, 4));
}

#[test]
fn test_value_widths() {
    for value in [0xFFFF_1234, 0xFFFF_FFFF_8000_0000, 0x0123_4567_89AB_CDEF, 0, u64::MAX] {
        let curried = unsafe { curry(echo as *const (), 0, &[value]) }.unwrap();
        assert_eq!(curried.call(&[]), value, "{value:#x}");
    }
}

#[test]
fn test_stack_alignment() {
    let target = curry_jit_test_entry_rsp as *const ();
    // Sanity check the probe itself
    assert_eq!(unsafe { curry_jit_test_entry_rsp() } & 0xF, 0x8);

    for (now, later) in [(1, 0), (0, 1), (1, 5), (6, 1), (7, 0), (3, 4), (7, 1), (8, 0), (2, 6), (9, 9)] {
        let args: Vec<u64> = (0..now as u64).collect();
        let curried = unsafe { curry(target, later, &args) }.unwrap();
        let rsp = curried.call(&vec![0; later]);
        assert_eq!(rsp & 0xF, 0x8, "({now}, {later}): rsp = {rsp:#x}");
    }
}

#[test]
fn test_overflow_splits() {
    let all: Vec<u64> = (0..8).map(word).collect();
    let direct = check8(all[0], all[1], all[2], all[3], all[4], all[5], all[6], all[7]);
    for now in 0..=8 {
        let curried = unsafe { curry(check8 as *const (), 8 - now, &all[..now]) }.unwrap();
        assert_eq!(curried.call(&all[now..]), direct, "now = {now}");
    }
}

#[test]
fn test_sixteen_args_split_evenly() {
    let args: Vec<u64> = (0..16).collect();
    let curried = unsafe { curry(check16 as *const (), 8, &args[..8]) }.unwrap();
    assert_eq!(curried.call(&args[8..]), 0xff);
}

#[test]
fn test_chain_four_at_a_time() {
    let c0 = unsafe { curry(check16 as *const (), 12, &[0x0, 0x1, 0x2, 0x3]) }.unwrap();
    let c1 = unsafe { curry(c0.into_raw(), 8, &[0x4, 0x5, 0x6, 0x7]) }.unwrap();
    let c2 = unsafe { curry(c1.into_raw(), 4, &[0x8, 0x9, 0xa, 0xb]) }.unwrap();
    let c3 = unsafe { curry(c2.into_raw(), 0, &[0xc, 0xd, 0xe, 0xf]) }.unwrap();
    assert_eq!(c3.call(&[]), 0xff);
}

#[test]
fn test_chain_through_overflow() {
    let c0 = unsafe { curry(check16 as *const (), 9, &[0x0, 0x1, 0x2, 0x3, 0x4, 0x5, 0x6]) }
        .unwrap();
    let c1 = unsafe { curry(c0.into_raw(), 2, &[0x7, 0x8, 0x9, 0xa, 0xb, 0xc, 0xd]) }.unwrap();
    let c2 = unsafe { curry(c1.into_raw(), 0, &[0xe, 0xf]) }.unwrap();
    assert_eq!(c2.call(&[]), 0xff);
}

#[test]
fn test_sixty_four_args_in_two_steps() {
    let _guard = RECORDER.lock().unwrap();
    let args: Vec<u64> = (0..64).map(word).collect();

    let first = unsafe { curry(recorder(), 32, &args[..32]) }.unwrap();
    let second = unsafe { curry(first.into_raw(), 0, &args[32..]) }.unwrap();
    assert_eq!(second.call(&[]), 0xff);
    assert_eq!(recorded().to_vec(), args);
}

#[test]
fn test_every_split_reaches_the_target_in_order() {
    let _guard = RECORDER.lock().unwrap();
    let args: Vec<u64> = (0..2 * MAX_ARGS).map(word).collect();

    for now in 0..=MAX_ARGS {
        for later in 0..=MAX_ARGS {
            let total = now + later;
            let curried = unsafe { curry(recorder(), later, &args[..now]) }.unwrap();
            assert_eq!(curried.call(&args[now..total]), 0xff);
            assert_eq!(&recorded()[..total], &args[..total], "({now}, {later})");
        }
    }
}

#[test]
fn test_count_boundaries() {
    let _guard = RECORDER.lock().unwrap();
    let args = [0xAAu64; MAX_ARGS + 1];

    assert!(matches!(
        unsafe { curry(recorder(), 0, &args) },
        Err(CurryError::TooManyArgs { now: 33, later: 0 })
    ));
    assert!(matches!(
        unsafe { curry(recorder(), MAX_ARGS + 1, &args[..1]) },
        Err(CurryError::TooManyArgs { now: 1, later: 33 })
    ));

    let at_max = unsafe { curry(recorder(), MAX_ARGS, &args[..MAX_ARGS]) }.unwrap();
    assert_eq!(at_max.call(&[0xBB; MAX_ARGS]), 0xff);
    let seen = recorded();
    assert!(seen[..MAX_ARGS].iter().all(|&w| w == 0xAA));
    assert!(seen[MAX_ARGS..].iter().all(|&w| w == 0xBB));
}

#[test]
fn test_vcurry_draws_from_a_shared_cursor() {
    let mut args = (0..16u64).chain([0xDEAD]);
    let c0 = unsafe { vcurry(check16 as *const (), 10, 6, &mut args) }.unwrap();
    let c1 = unsafe { vcurry(c0.into_raw(), 6, 0, &mut args) }.unwrap();
    assert_eq!(args.next(), Some(0xDEAD));
    assert_eq!(c1.call(&[]), 0xff);
}

#[test]
fn test_dropping_uncalled_thunks() {
    for n in 0..64 {
        let curried: Curried = unsafe { curry(echo as *const (), 0, &[n]) }.unwrap();
        if n % 2 == 0 {
            drop(curried);
        } else {
            assert_eq!(curried.call(&[]), n);
        }
    }
}

#[test]
fn test_concurrent_currying() {
    let handles: Vec<_> = (0..8u64)
        .map(|t| {
            thread::spawn(move || {
                for i in 0..200u64 {
                    let curried =
                        unsafe { curry(sub2 as *const (), 1, &[t * 1000 + i]) }.unwrap();
                    assert_eq!(curried.call(&[i]), sub2(t * 1000 + i, i));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_handle_moves_across_threads() {
    let curried = unsafe { curry(check8 as *const (), 3, &[1, 2, 3, 4, 5]) }.unwrap();
    let result = thread::spawn(move || curried.call(&[6, 7, 8])).join().unwrap();
    assert_eq!(result, check8(1, 2, 3, 4, 5, 6, 7, 8));
}

#[test]
fn test_curry_macro() {
    let curried = unsafe { curry_jit::curry!(check8, later = 2; 1, 2, 3, 4, 5, 6) }.unwrap();
    assert_eq!(curried.call(&[7, 8]), check8(1, 2, 3, 4, 5, 6, 7, 8));
}

#[test]
fn test_c_abi() {
    use curry_jit::ffi::curry_jit_curry;
    use std::ffi::c_void;

    let now = [0x0123_4567_89AB_CDEFu64, 0xFFFF_FFFF_8000_0000];
    let entry = unsafe { curry_jit_curry(sub2 as *const c_void, 2, 0, now.as_ptr()) };
    assert!(!entry.is_null());
    let f: extern "C" fn() -> u64 = unsafe { std::mem::transmute(entry) };
    assert_eq!(f(), sub2(now[0], now[1]));

    let null = unsafe { curry_jit_curry(sub2 as *const c_void, MAX_ARGS + 1, 0, now.as_ptr()) };
    assert!(null.is_null());
}
