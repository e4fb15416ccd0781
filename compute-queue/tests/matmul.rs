//! Matrix multiplication, one thread per output element, checked against a
//! naive host product.

mod common;

use bytemuck::{Pod, Zeroable};
use compute_queue::{ComputePipelineState, Device, ResourceOptions, Size3D};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;

const MUL: &str = r#"
struct Params {
    col_a: i32,
    col_b: i32,
}

@group(0) @binding(0) var<storage, read> a: array<f32>;
@group(0) @binding(1) var<storage, read> b: array<f32>;
@group(0) @binding(2) var<storage, read_write> out_data: array<f32>;
@group(0) @binding(3) var<uniform> params: Params;

@compute @workgroup_size(1)
fn mat_mul(@builtin(global_invocation_id) id: vec3<u32>) {
    let index = i32(id.x);
    let row = index / params.col_b;
    let col = index % params.col_b;
    var sum = 0.0;
    for (var k = 0; k < params.col_a; k++) {
        sum += a[row * params.col_a + k] * b[k * params.col_b + col];
    }
    out_data[index] = sum;
}
"#;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Params {
    col_a: i32,
    col_b: i32,
}

#[derive(Debug, Clone, PartialEq)]
struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Matrix {
    fn new(rows: usize, cols: usize, data: Vec<f32>) -> Self {
        assert_eq!(rows * cols, data.len());
        Self { rows, cols, data }
    }

    /// Values in `[0, 1)` drawn from `rng`.
    fn random(rows: usize, cols: usize, rng: &mut Pcg64) -> Self {
        let data = (0..rows * cols).map(|_| rng.random::<f32>()).collect();
        Self::new(rows, cols, data)
    }

    fn mul_host(&self, other: &Self) -> Self {
        assert_eq!(self.cols, other.rows);
        let mut data = vec![0.0; self.rows * other.cols];
        for row in 0..self.rows {
            for col in 0..other.cols {
                data[row * other.cols + col] = (0..self.cols)
                    .map(|k| self.data[row * self.cols + k] * other.data[k * other.cols + col])
                    .sum();
            }
        }
        Self::new(self.rows, other.cols, data)
    }
}

/// How the shape parameters reach the kernel.
#[derive(Debug, Clone, Copy)]
enum ParamsBinding {
    Buffer,
    Inline,
}

fn mul_device(
    device: &Device,
    pipeline: &ComputePipelineState,
    a: &Matrix,
    b: &Matrix,
    binding: ParamsBinding,
) -> Matrix {
    let shared = ResourceOptions::default();
    let lhs = device.make_buffer_with_data(&a.data, shared).unwrap();
    let rhs = device.make_buffer_with_data(&b.data, shared).unwrap();
    let out = device
        .make_buffer(None, (a.rows * b.cols * size_of::<f32>()) as u64, shared)
        .unwrap();
    let params = Params {
        col_a: a.cols as i32,
        col_b: b.cols as i32,
    };

    let queue = device.make_command_queue_with_label("matmul");
    let mut command_buffer = queue.make_command_buffer();
    let mut encoder = command_buffer.make_compute_command_encoder().unwrap();
    encoder.set_compute_pipeline_state(pipeline).unwrap();
    encoder.set_buffer(&lhs, 0, 0).unwrap();
    encoder.set_buffer(&rhs, 0, 1).unwrap();
    encoder.set_buffer(&out, 0, 2).unwrap();
    match binding {
        ParamsBinding::Buffer => {
            let params = device.make_buffer_with_data(&[params], shared).unwrap();
            encoder.set_buffer(&params, 0, 3).unwrap();
        }
        ParamsBinding::Inline => encoder.set_value(&params, 3).unwrap(),
    }
    encoder
        .dispatch_threads(Size3D::linear((a.rows * b.cols) as u32), Size3D::ONE)
        .unwrap();
    encoder.end_encoding();
    command_buffer.commit().unwrap();
    command_buffer.wait_until_completed().unwrap();

    Matrix::new(a.rows, b.cols, out.read::<f32>().unwrap())
}

fn assert_close(got: &Matrix, want: &Matrix) {
    assert_eq!((got.rows, got.cols), (want.rows, want.cols));
    for (index, (g, w)) in got.data.iter().zip(&want.data).enumerate() {
        assert!(
            (g - w).abs() <= 1e-4 * w.abs().max(1.0),
            "element {index}: got {g}, want {w}"
        );
    }
}

#[test]
fn mul_matches_host_product() {
    let Some(device) = common::device_or_skip() else {
        return;
    };
    let pipeline = common::pipeline(&device, MUL, "mat_mul");
    assert_eq!(pipeline.argument_slots().len(), 4);

    let mut rng = Pcg64::seed_from_u64(0x5eed);
    let cases = [
        (
            Matrix::new(2, 2, vec![1.0, 2.0, 3.0, 4.0]),
            Matrix::new(2, 2, vec![5.0, 6.0, 7.0, 8.0]),
        ),
        (
            Matrix::new(2, 1, vec![1.0, 2.0]),
            Matrix::new(1, 2, vec![3.0, 4.0]),
        ),
        (
            Matrix::new(1, 2, vec![1.0, 2.0]),
            Matrix::new(2, 1, vec![3.0, 4.0]),
        ),
        (
            Matrix::new(2, 1, vec![1.0, 2.0]),
            Matrix::new(1, 10, (1..=10).map(|v| v as f32).collect()),
        ),
        (
            Matrix::new(1, 2, vec![1.0, 2.0]),
            Matrix::new(2, 3, vec![3.0, 4.0, 5.0, 6.0, 7.0, 8.0]),
        ),
        (
            Matrix::random(7, 6, &mut rng),
            Matrix::random(6, 3, &mut rng),
        ),
    ];

    for (a, b) in &cases {
        let want = a.mul_host(b);
        for binding in [ParamsBinding::Buffer, ParamsBinding::Inline] {
            let got = mul_device(&device, &pipeline, a, b, binding);
            assert_close(&got, &want);
        }
    }
}

#[test]
fn inline_params_match_buffer_params() {
    let Some(device) = common::device_or_skip() else {
        return;
    };
    let pipeline = common::pipeline(&device, MUL, "mat_mul");
    let mut rng = Pcg64::seed_from_u64(0x5eed);
    let a = Matrix::random(5, 4, &mut rng);
    let b = Matrix::random(4, 9, &mut rng);

    let from_buffer = mul_device(&device, &pipeline, &a, &b, ParamsBinding::Buffer);
    let inline = mul_device(&device, &pipeline, &a, &b, ParamsBinding::Inline);
    assert_eq!(inline, from_buffer);
    assert_close(&inline, &a.mul_host(&b));
}

#[test]
fn known_product() {
    let a = Matrix::new(2, 2, vec![1.0, 2.0, 3.0, 4.0]);
    let b = Matrix::new(2, 2, vec![5.0, 6.0, 7.0, 8.0]);
    assert_eq!(a.mul_host(&b).data, [19.0, 22.0, 43.0, 50.0]);
}
