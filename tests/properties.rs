mod common;

use common::{blur, cube_phantom, max_abs_difference, observed_view};
use mvdecon::convolution::{CpuFftBackend, KernelSpectrum};
use mvdecon::kernel_ops::mirror;
use mvdecon::psf_extraction::{gaussian_psf, transform_psf, AffineTransform3};
use mvdecon::{
    build_kernel_pairs, run, run_with_accelerators, AcceleratorProvider, ConvolutionBackend,
    DeconvolutionConfig, DeconvolutionError, DeconvolutionPhase, Device, MultiViewDeconvolution,
    OsemMode, PsfType, ViewId, ViewInput, Volume,
};
use nalgebra::{Matrix3, Vector3};
use ndarray::Array3;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const SHAPE: [usize; 3] = [12, 12, 12];

/// Three views with overlapping, smoothly varying weights.
fn three_views() -> Vec<ViewInput> {
    let truth = cube_phantom(SHAPE, 3, 9, 1.0, 6.0);
    let psfs = [
        gaussian_psf([3, 3, 5], [0.6, 0.6, 1.2]).unwrap(),
        gaussian_psf([5, 3, 3], [1.2, 0.6, 0.6]).unwrap(),
        gaussian_psf([3, 5, 3], [0.6, 1.2, 0.6]).unwrap(),
    ];
    psfs.into_iter()
        .enumerate()
        .map(|(setup, psf)| {
            let weight = Array3::from_shape_fn(SHAPE, |(i, j, k)| {
                // ramps from 0 to 1.4 along the view's own axis, view 2 also misses i = 0
                let w = 1.4 * [i, j, k][setup] as f32 / 11.0;
                if setup == 2 && i == 0 { 0.0 } else { w }
            });
            observed_view(setup as u32, &truth, psf, Volume::from_array(weight))
        })
        .collect()
}

fn short_config(psf_type: PsfType) -> DeconvolutionConfig {
    DeconvolutionConfig {
        psf_type,
        num_iterations: 3,
        ..Default::default()
    }
}

#[test]
fn compound_kernels_of_transformed_psfs_are_normalized() {
    let psf = gaussian_psf([3, 3, 7], [0.7, 0.7, 1.8]).unwrap();
    let (s, c) = (0.5f64.sqrt(), 0.5f64.sqrt());
    let rotations = [
        AffineTransform3::identity(),
        AffineTransform3::new(
            Matrix3::new(c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0),
            Vector3::zeros(),
        ),
        AffineTransform3::new(
            Matrix3::new(1.0, 0.0, 0.0, 0.0, 0.0, -1.0, 0.0, 1.0, 0.0),
            Vector3::zeros(),
        ),
    ];
    let psfs: Vec<Array3<f32>> = rotations
        .iter()
        .map(|affine| transform_psf(&psf, affine).unwrap())
        .collect();

    for psf_type in [
        PsfType::Independent,
        PsfType::EfficientBayesian,
        PsfType::OptimizationI,
        PsfType::OptimizationII,
    ] {
        let set = build_kernel_pairs(&psfs, psf_type).unwrap();
        for (_, pair) in &set.pairs {
            assert!((pair.kernel2.sum() - 1.0).abs() < 1e-5);
            if psf_type == PsfType::Independent {
                assert_eq!(pair.kernel2, mirror(&pair.kernel1));
            }
        }
    }
}

#[test]
fn normalized_weights_sum_to_at_most_one() {
    let deconvolution =
        MultiViewDeconvolution::new(three_views(), short_config(PsfType::OptimizationI), None)
            .unwrap();
    let units = deconvolution.views();
    assert_eq!(units.len(), 3);
    for index in ndarray::indices(SHAPE) {
        let sum: f32 = units.iter().map(|u| u.weight()[index]).sum();
        assert!(sum <= 1.0 + 1e-5, "weight sum {sum} at {index:?}");
    }
}

#[test]
fn osem_speedup_scales_weights_up_to_one() {
    let baseline =
        MultiViewDeconvolution::new(three_views(), short_config(PsfType::Independent), None)
            .unwrap();
    for osem in [OsemMode::Off, OsemMode::MinOverlap, OsemMode::AvgOverlap] {
        let config = DeconvolutionConfig {
            osem,
            ..short_config(PsfType::Independent)
        };
        let accelerated = MultiViewDeconvolution::new(three_views(), config, None).unwrap();
        let speedup = (match osem {
            OsemMode::Off => 1.0,
            OsemMode::MinOverlap => baseline.min_overlapping_views(),
            _ => baseline.avg_overlapping_views(),
        }) as f32;
        for (plain, scaled) in baseline.views().iter().zip(accelerated.views()) {
            for (p, s) in plain.weight().iter().zip(scaled.weight().iter()) {
                assert!(*s <= 1.0);
                assert!((s - (p * speedup).min(1.0)).abs() < 1e-5);
            }
        }
    }
}

#[test]
fn psi_stays_above_minimum_and_uncovered_voxels_are_cleared() {
    let config = DeconvolutionConfig {
        min_value: 0.05,
        ..short_config(PsfType::EfficientBayesian)
    };
    let mut deconvolution = MultiViewDeconvolution::new(three_views(), config, None).unwrap();
    for _ in 0..3 {
        deconvolution.run_iteration().unwrap();
        assert!(deconvolution.psi().data.iter().all(|v| *v >= 0.05));
    }

    // no view covers the voxels with i = 0 and j = 0
    let psi = deconvolution.run().unwrap();
    assert_eq!(psi.data[[0, 0, 5]], 0.0);
    assert_eq!(psi.data[[0, 0, 0]], 0.0);
    assert!(psi.data[[0, 5, 0]] >= 0.05);
    assert!(psi.data[[5, 5, 5]] >= 0.05);
}

#[test]
fn blocks_reproduce_the_whole_volume_run() {
    let whole = run(three_views(), &short_config(PsfType::EfficientBayesian)).unwrap();
    let config = DeconvolutionConfig {
        block_size: Some([8, 9, 10]),
        ..short_config(PsfType::EfficientBayesian)
    };
    let tiled = run(three_views(), &config).unwrap();
    assert!(max_abs_difference(&whole.data, &tiled.data) < 1e-3);
}

#[test]
fn zero_psf_view_is_dropped() {
    let mut views = three_views();
    views[1].psf = Array3::zeros((3, 3, 3));
    let mut deconvolution =
        MultiViewDeconvolution::new(views, short_config(PsfType::EfficientBayesian), None).unwrap();
    assert_eq!(deconvolution.view_ids(), vec![ViewId::new(0, 0), ViewId::new(0, 2)]);
    assert!(matches!(
        deconvolution.rejected_views(),
        [DeconvolutionError::ViewRejected { view: 1, .. }]
    ));
    assert!(deconvolution.run().is_ok());
}

#[test]
fn blurred_truth_matches_the_forward_model() {
    // blurring the truth with a view's forward kernel reproduces its image
    let truth = cube_phantom(SHAPE, 3, 9, 1.0, 6.0);
    let views = three_views();
    let images: Vec<Array3<f32>> = views.iter().map(|v| v.image.data.clone()).collect();
    let deconvolution =
        MultiViewDeconvolution::new(views, short_config(PsfType::Independent), None).unwrap();
    for (unit, image) in deconvolution.views().iter().zip(&images) {
        let mut blurred = Array3::zeros(SHAPE);
        unit.convolve_forward(&truth, &mut blurred).unwrap();
        assert!(max_abs_difference(&blurred, image) < 1e-4);
        assert!(max_abs_difference(&blurred, &blur(&truth, &unit.kernels().kernel1)) < 1e-4);
    }
}

/// CPU convolution exposed as accelerators, counting processed blocks.
struct SimulatedAccelerators {
    available: Vec<u32>,
    processed: Arc<AtomicUsize>,
}

struct SimulatedDevice {
    id: u32,
    inner: CpuFftBackend,
    processed: Arc<AtomicUsize>,
}

impl ConvolutionBackend for SimulatedDevice {
    fn device(&self) -> Device {
        Device::Accelerator(self.id)
    }

    fn convolve_block(
        &self,
        block: &mut Array3<f32>,
        kernel: &KernelSpectrum,
    ) -> mvdecon::Result<()> {
        self.processed.fetch_add(1, Ordering::SeqCst);
        self.inner.convolve_block(block, kernel)
    }
}

impl AcceleratorProvider for SimulatedAccelerators {
    fn open(
        &self,
        device_id: u32,
        block_size: [usize; 3],
    ) -> mvdecon::Result<Box<dyn ConvolutionBackend>> {
        if !self.available.contains(&device_id) {
            return Err(DeconvolutionError::config(format!("no device {device_id}")));
        }
        Ok(Box::new(SimulatedDevice {
            id: device_id,
            inner: CpuFftBackend::new(block_size),
            processed: self.processed.clone(),
        }))
    }
}

#[test]
fn accelerators_match_the_cpu() {
    let provider = SimulatedAccelerators {
        available: vec![0, 1],
        processed: Arc::new(AtomicUsize::new(0)),
    };
    let cpu_config = DeconvolutionConfig {
        block_size: Some([8, 8, 8]),
        ..short_config(PsfType::OptimizationII)
    };
    let device_config = DeconvolutionConfig {
        devices: vec![0, 1, -1],
        ..cpu_config.clone()
    };

    let expected = run(three_views(), &cpu_config).unwrap();
    let actual = run_with_accelerators(three_views(), &device_config, &provider).unwrap();
    assert!(provider.processed.load(Ordering::SeqCst) > 0);
    assert!(max_abs_difference(&expected.data, &actual.data) < 1e-4);
}

#[test]
fn accelerators_run_with_a_single_thread_pool() {
    let provider = SimulatedAccelerators {
        available: vec![0, 1],
        processed: Arc::new(AtomicUsize::new(0)),
    };
    let cpu_config = DeconvolutionConfig {
        block_size: Some([8, 8, 8]),
        ..short_config(PsfType::EfficientBayesian)
    };
    let device_config = DeconvolutionConfig {
        devices: vec![0, 1],
        num_threads: Some(1),
        ..cpu_config.clone()
    };

    let expected = run(three_views(), &cpu_config).unwrap();
    let actual = run_with_accelerators(three_views(), &device_config, &provider).unwrap();
    assert!(provider.processed.load(Ordering::SeqCst) > 0);
    assert!(max_abs_difference(&expected.data, &actual.data) < 1e-4);
}

#[test]
fn missing_accelerators_fall_back_or_fail() {
    let provider = SimulatedAccelerators {
        available: vec![],
        processed: Arc::new(AtomicUsize::new(0)),
    };
    let config = DeconvolutionConfig {
        devices: vec![3],
        ..short_config(PsfType::Independent)
    };
    let deconvolution =
        MultiViewDeconvolution::new(three_views(), config.clone(), Some(&provider)).unwrap();
    assert_eq!(deconvolution.devices(), vec![Device::Cpu]);

    let strict = DeconvolutionConfig {
        cpu_fallback: false,
        ..config
    };
    let result = MultiViewDeconvolution::new(three_views(), strict, Some(&provider));
    assert!(matches!(result, Err(DeconvolutionError::Configuration(_))));
}

/// A single accelerator that fails once it has convolved `working_blocks` blocks.
struct FailingAccelerator {
    working_blocks: usize,
    calls: Arc<AtomicUsize>,
}

struct FailingDevice {
    inner: CpuFftBackend,
    working_blocks: usize,
    calls: Arc<AtomicUsize>,
}

impl ConvolutionBackend for FailingDevice {
    fn device(&self) -> Device {
        Device::Accelerator(0)
    }

    fn convolve_block(
        &self,
        block: &mut Array3<f32>,
        kernel: &KernelSpectrum,
    ) -> mvdecon::Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) >= self.working_blocks {
            return Err(DeconvolutionError::backend(self.device(), "device lost"));
        }
        self.inner.convolve_block(block, kernel)
    }
}

impl AcceleratorProvider for FailingAccelerator {
    fn open(
        &self,
        _device_id: u32,
        block_size: [usize; 3],
    ) -> mvdecon::Result<Box<dyn ConvolutionBackend>> {
        Ok(Box::new(FailingDevice {
            inner: CpuFftBackend::new(block_size),
            working_blocks: self.working_blocks,
            calls: self.calls.clone(),
        }))
    }
}

#[test]
fn backend_failure_keeps_the_last_completed_iteration() {
    // one block per convolution, two convolutions per view: iteration 1 takes six blocks and
    // iteration 2 fails after the update of its first view
    let provider = FailingAccelerator {
        working_blocks: 8,
        calls: Arc::new(AtomicUsize::new(0)),
    };
    let config = DeconvolutionConfig {
        devices: vec![0],
        keep_best_effort: true,
        num_iterations: 5,
        ..short_config(PsfType::EfficientBayesian)
    };
    let cpu_config = DeconvolutionConfig {
        devices: vec![-1],
        ..config.clone()
    };
    let mut reference = MultiViewDeconvolution::new(three_views(), cpu_config, None).unwrap();
    reference.run_iteration().unwrap();

    let mut deconvolution =
        MultiViewDeconvolution::new(three_views(), config, Some(&provider)).unwrap();
    assert_eq!(deconvolution.devices(), vec![Device::Accelerator(0)]);
    let result = deconvolution.run();
    assert!(matches!(
        result,
        Err(DeconvolutionError::Backend {
            device: Device::Accelerator(0),
            ..
        })
    ));
    assert_eq!(deconvolution.phase(), DeconvolutionPhase::Iterating(1));
    assert_eq!(deconvolution.iteration_history().len(), 1);
    assert_eq!(deconvolution.interrupted_iteration(), Some(2));

    let best_effort = deconvolution.best_effort_psi().unwrap();
    assert!(max_abs_difference(&best_effort.data, &reference.psi().data) < 1e-5);
    // the first view of iteration 2 already moved psi
    assert!(max_abs_difference(&best_effort.data, &deconvolution.psi().data) > 0.0);

    // the partly updated estimate is never carried on
    let calls = provider.calls.load(Ordering::SeqCst);
    assert!(matches!(
        deconvolution.run(),
        Err(DeconvolutionError::Configuration(_))
    ));
    assert!(matches!(
        deconvolution.run_iteration(),
        Err(DeconvolutionError::Configuration(_))
    ));
    assert_eq!(provider.calls.load(Ordering::SeqCst), calls);
    assert_eq!(deconvolution.phase(), DeconvolutionPhase::Iterating(1));
}
