//! End-to-end emulation scenarios: assemble, link, run.

use fcom_as::assemble;
use fcom_link::{link, LinkInput, LinkOptions};
use fcom_obj::ObjectFile;
use fcom_vm::{fp_exception, nan_code_f32, Config, Emulator, ExitStatus};

fn build(src: &str) -> ObjectFile {
    let object = assemble(src).expect("assemble").object;
    let input = LinkInput {
        modules: vec![("test.ob".to_string(), object)],
        libraries: Vec::new(),
    };
    link(input, &LinkOptions::default()).expect("link").executable
}

fn run(src: &str) -> (ExitStatus, Emulator) {
    let exe = build(src);
    let config = Config {
        step_limit: Some(100_000),
        ..Config::default()
    };
    let mut emu = Emulator::new(&exe, &config).expect("emulator");
    let status = emu.run(&config).expect("run");
    (status, emu)
}

#[test]
fn arithmetic_and_return_value() {
    let (status, emu) = run(
        "code section execute\n\
         main: function public\n\
         r0 = 5\n\
         r1 = 7\n\
         r0 = add(r0, r1)\n\
         return\n\
         main end\n\
         code end\n",
    );
    assert_eq!(status, ExitStatus::Returned(12));
    assert_eq!(emu.counters().instructions, 4);
}

#[test]
fn loops_take_backward_branches() {
    // sum 1..=10 via a countdown loop
    let (status, emu) = run(
        "code section execute\n\
         main: function public\n\
         r0 = 0\n\
         r1 = 10\n\
         loop:\n\
         r0 = add(r0, r1)\n\
         r1 = sub(r1, 1)\n\
         jump_nzero(r1, loop)\n\
         return\n\
         main end\n\
         code end\n",
    );
    assert_eq!(status, ExitStatus::Returned(55));
    assert!(emu.counters().jumps >= 10);
}

#[test]
fn calls_nest_and_return() {
    let (status, _) = run(
        "code section execute\n\
         main: function public\n\
         r0 = 1\n\
         call twice\n\
         call twice\n\
         return\n\
         main end\n\
         twice: function public\n\
         r0 = add(r0, r0)\n\
         return\n\
         twice end\n\
         code end\n",
    );
    assert_eq!(status, ExitStatus::Returned(4));
}

#[test]
fn data_loads_and_stores() {
    let (status, mut emu) = run(
        "data section read write\n\
         int64 x = 40\n\
         int64 y = 0\n\
         data end\n\
         code section execute\n\
         main: function public\n\
         r0 = x\n\
         r0 = add(r0, 2)\n\
         [y] = r0\n\
         return\n\
         main end\n\
         code end\n",
    );
    assert_eq!(status, ExitStatus::Returned(42));
    // y sits 8 bytes after x in the data region
    let exe_y = emu.regs().datap + 8;
    assert_eq!(emu.read_mem(exe_y, 8).unwrap(), 42);
}

#[test]
fn memory_permissions_trap() {
    let exe = build(
        "code section execute\n\
         main: function public\n\
         r1 = 16\n\
         [r1] = r0\n\
         return\n\
         main end\n\
         code end\n",
    );
    let config = Config::default();
    let mut emu = Emulator::new(&exe, &config).expect("emulator");
    let err = emu.run(&config).expect_err("write to low memory must trap");
    let text = err.to_string();
    assert!(text.contains("write"), "{text}");
}

#[test]
fn step_limit_stops_infinite_loops() {
    let exe = build(
        "code section execute\n\
         main: function public\n\
         here:\n\
         jump here\n\
         main end\n\
         code end\n",
    );
    let config = Config {
        step_limit: Some(64),
        ..Config::default()
    };
    let mut emu = Emulator::new(&exe, &config).expect("emulator");
    let err = emu.run(&config).expect_err("must hit the limit");
    assert!(err.to_string().contains("step limit"), "{err}");
}

#[test]
fn nan_payload_propagates_through_float_arithmetic() {
    // sqrt(-1) in single precision, add 1.0, store: the stored word is a
    // quiet NaN whose payload carries the invalid-sqrt code, and exactly
    // three instructions run up to the store
    let exe = build(
        "data section read write\n\
         float result = 0.0\n\
         data end\n\
         code section execute\n\
         main: function public\n\
         float v1 = sqrt(v1)\n\
         float v1 = add(v1, 1.0)\n\
         [result] = v1\n\
         return\n\
         main end\n\
         code end\n",
    );
    let config = Config::default();
    let mut emu = Emulator::new(&exe, &config).expect("emulator");
    // harness setup: v1 holds one single-precision −1.0
    emu.regs_mut()
        .set_vector_element(1, 0, 4, u64::from((-1.0f32).to_bits()));

    for _ in 0..3 {
        emu.step().expect("step");
    }
    assert_eq!(emu.counters().instructions, 3);

    let result_addr = emu.regs().datap;
    let stored = emu.read_mem(result_addr, 4).unwrap() as u32;
    assert!(f32::from_bits(stored).is_nan());
    assert_eq!(nan_code_f32(stored), Some(fp_exception::INVALID_SQRT));
}

#[test]
fn vector_length_and_compress_sparse() {
    // v1 = int32 0..15 over 64 bytes; v0 mask selects alternating
    // elements; compress packs the even values and halves the length
    let exe = build(
        "code section execute\n\
         main: function public\n\
         int32 v2 = compress_sparse(v1, mask = v0)\n\
         return\n\
         main end\n\
         code end\n",
    );
    let config = Config::default();
    let mut emu = Emulator::new(&exe, &config).expect("emulator");
    {
        let regs = emu.regs_mut();
        regs.set_vector_length(1, 64);
        for i in 0..16u32 {
            regs.set_vector_element(1, i * 4, 4, u64::from(i));
        }
        regs.set_vector_length(0, 64);
        for i in 0..16u32 {
            regs.set_vector_element(0, i * 4, 4, u64::from(i % 2 == 0));
        }
    }
    emu.step().expect("compress");
    assert_eq!(emu.regs().vector_length(2), 32);
    let values: Vec<u64> = (0..8).map(|i| emu.regs().vector_element(2, i * 4, 4)).collect();
    assert_eq!(values, [0, 2, 4, 6, 8, 10, 12, 14]);
}

#[test]
fn vector_float_add_per_element() {
    let exe = build(
        "code section execute\n\
         main: function public\n\
         float v2 = add(v1, v1)\n\
         return\n\
         main end\n\
         code end\n",
    );
    let config = Config::default();
    let mut emu = Emulator::new(&exe, &config).expect("emulator");
    {
        let regs = emu.regs_mut();
        for (i, v) in [1.5f32, -2.0, 0.25, 100.0].iter().enumerate() {
            regs.set_vector_element(1, i as u32 * 4, 4, u64::from(v.to_bits()));
        }
    }
    emu.step().expect("add");
    for (i, v) in [3.0f32, -4.0, 0.5, 200.0].iter().enumerate() {
        let bits = emu.regs().vector_element(2, i as u32 * 4, 4) as u32;
        assert_eq!(f32::from_bits(bits), *v);
    }
}

#[test]
fn if_else_selects_the_right_arm() {
    let (status, _) = run(
        "code section execute\n\
         main: function public\n\
         r1 = 3\n\
         if (r1 > 0)\n\
         {\n\
         r0 = 10\n\
         }\n\
         else\n\
         {\n\
         r0 = 20\n\
         }\n\
         return\n\
         main end\n\
         code end\n",
    );
    assert_eq!(status, ExitStatus::Returned(10));
}

#[test]
fn for_loop_counts() {
    let (status, _) = run(
        "code section execute\n\
         main: function public\n\
         r0 = 0\n\
         for (r1 = 0; r1 < 5; r1 = add(r1, 1))\n\
         {\n\
         r0 = add(r0, 2)\n\
         }\n\
         return\n\
         main end\n\
         code end\n",
    );
    assert_eq!(status, ExitStatus::Returned(10));
}

#[test]
fn integer_division_by_zero_saturates() {
    // one convention for div, div_u and rem: a zero divisor yields the
    // largest representable value of the operand type
    let (status, _) = run(
        "code section execute\n\
         main: function public\n\
         r0 = 7\n\
         r1 = 0\n\
         r0 = div(r0, r1)\n\
         return\n\
         main end\n\
         code end\n",
    );
    assert_eq!(status, ExitStatus::Returned(i64::MAX as u64));

    let (status, _) = run(
        "code section execute\n\
         main: function public\n\
         r0 = 7\n\
         r1 = 0\n\
         r0 = div_u(r0, r1)\n\
         return\n\
         main end\n\
         code end\n",
    );
    assert_eq!(status, ExitStatus::Returned(u64::MAX));

    let (status, _) = run(
        "code section execute\n\
         main: function public\n\
         r0 = 7\n\
         r1 = 0\n\
         r0 = rem(r0, r1)\n\
         return\n\
         main end\n\
         code end\n",
    );
    assert_eq!(status, ExitStatus::Returned(i64::MAX as u64));
}

#[test]
fn vector_integer_ops_cover_the_full_table() {
    // rem per element, including the zero-divisor convention
    let exe = build(
        "code section execute\n\
         main: function public\n\
         int32 v2 = rem(v1, v0)\n\
         return\n\
         main end\n\
         code end\n",
    );
    let config = Config::default();
    let mut emu = Emulator::new(&exe, &config).expect("emulator");
    {
        let regs = emu.regs_mut();
        regs.set_vector_element(1, 0, 4, 7);
        regs.set_vector_element(1, 4, 4, 9);
        regs.set_vector_element(0, 0, 4, 4);
        regs.set_vector_element(0, 4, 4, 0);
    }
    emu.step().expect("rem");
    assert_eq!(emu.regs().vector_element(2, 0, 4), 3);
    assert_eq!(emu.regs().vector_element(2, 4, 4), 0x7fff_ffff);
}

#[test]
fn vector_three_operand_forms_execute() {
    let exe = build(
        "code section execute\n\
         main: function public\n\
         int32 v0 = mul_add(v0, v1, v2)\n\
         return\n\
         main end\n\
         code end\n",
    );
    let config = Config::default();
    let mut emu = Emulator::new(&exe, &config).expect("emulator");
    {
        let regs = emu.regs_mut();
        regs.set_vector_element(0, 0, 4, 2);
        regs.set_vector_element(1, 0, 4, 3);
        regs.set_vector_element(2, 0, 4, 4);
    }
    emu.step().expect("mul_add");
    assert_eq!(emu.regs().vector_element(0, 0, 4), 10);
}
