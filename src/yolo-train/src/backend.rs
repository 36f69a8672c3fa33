use burn::backend::Autodiff;

#[cfg(feature = "cuda")]
pub type TrainBackend = burn::backend::Cuda<f32, i32>;
#[cfg(all(feature = "wgpu", not(feature = "cuda")))]
pub type TrainBackend = burn::backend::Wgpu<f32, i32>;
#[cfg(not(any(feature = "cuda", feature = "wgpu")))]
pub type TrainBackend = burn::backend::NdArray<f32>;

pub type AutodiffTrainBackend = Autodiff<TrainBackend>;

pub fn backend_name() -> &'static str {
    if cfg!(feature = "cuda") {
        "cuda"
    } else if cfg!(feature = "wgpu") {
        "wgpu"
    } else {
        "ndarray"
    }
}
