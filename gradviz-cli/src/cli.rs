use std::{path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand};

use strum::Display;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Model name.
    /// Supported models: squeezenet, resnet18
    #[arg(short, long, default_value = "squeezenet")]
    pub model: Model,

    /// Number of threads used to parallelize a single operation. Must be greater than 0 and less than 65536.
    /// Example: --threads 8
    #[arg(short, long, default_value = "4", value_parser = clap::value_parser!(u16).range(1..))]
    pub threads: u16,

    /// Synset file with one class name per line, used to print class names.
    /// Defaults to models/synset.txt when that file exists.
    #[arg(long)]
    pub labels: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Classify images and print the top class probabilities
    Classify {
        /// Input image path.
        /// Example: --input /path/to/image1.jpg --input /path/to/image2.jpg
        #[arg(short, long, required = true)]
        input: Vec<PathBuf>,

        /// Number of top inferred class probabilities to show.
        #[arg(short, long, default_value = "5", value_parser = clap::value_parser!(u16).range(1..=1000))]
        show: u16,
    },

    /// Print the layer names of the translated model
    Layers,

    /// Render per-pixel saliency maps for the given images
    Saliency {
        #[arg(short, long, required = true)]
        input: Vec<PathBuf>,

        /// Ground-truth class index per image; the model's own prediction is
        /// used when omitted.
        #[arg(short, long)]
        label: Vec<usize>,

        /// Output path prefix; maps are written as <prefix><index>.png
        #[arg(short, long, default_value = "saliency-")]
        output: String,
    },

    /// Perturb an image until the model predicts the target class
    Fool {
        #[arg(short, long)]
        input: PathBuf,

        /// Class index the perturbed image should be classified as.
        #[arg(long)]
        target: usize,

        /// Step size of each normalized-gradient ascent step.
        #[arg(long, default_value_t = 1.0)]
        step_size: f32,

        #[arg(long, default_value_t = 100)]
        max_iterations: usize,

        #[arg(short, long, default_value = "fooling.png")]
        output: PathBuf,
    },

    /// Synthesize an image that maximizes a class score, starting from noise
    Dream {
        /// Class index to maximize.
        #[arg(long)]
        target: usize,

        #[arg(long, default_value_t = 25.0)]
        learning_rate: f32,

        /// Weight of the L2 penalty on pixel magnitude.
        #[arg(long, default_value_t = 1e-3)]
        l2_reg: f32,

        #[arg(long, default_value_t = 200)]
        iterations: usize,

        /// Blur the image every N iterations (0 disables blurring).
        #[arg(long, default_value_t = 10)]
        blur_every: usize,

        /// Maximum random circular shift per iteration, in pixels.
        #[arg(long, default_value_t = 16)]
        max_jitter: i64,

        /// Spatial size of the synthesized image.
        #[arg(long, default_value_t = 224)]
        size: usize,

        /// Additionally write the image every N iterations.
        #[arg(long)]
        snapshot_every: Option<usize>,

        /// Fixed RNG seed for reproducible runs.
        #[arg(long)]
        seed: Option<u64>,

        #[arg(short, long, default_value = "dream.png")]
        output: PathBuf,
    },

    /// Combine the content of one image with the style of another
    Style {
        /// Image providing the content.
        #[arg(long)]
        content: PathBuf,

        /// Image providing the style.
        #[arg(long)]
        style: PathBuf,

        /// Shorter side of the working resolution, in pixels.
        #[arg(long, default_value_t = 192)]
        size: u32,

        /// Layer whose activation must match the content image; the model's
        /// default is used when omitted (see the layers subcommand).
        #[arg(long)]
        content_layer: Option<String>,

        #[arg(long, default_value_t = 5e-2)]
        content_weight: f32,

        /// Layers whose Gram matrices must match the style image.
        #[arg(long)]
        style_layer: Vec<String>,

        /// One weight per style layer.
        #[arg(long)]
        style_weight: Vec<f32>,

        #[arg(long, default_value_t = 5e-2)]
        tv_weight: f32,

        #[arg(long, default_value_t = 200)]
        iterations: usize,

        #[arg(long, default_value_t = 3.0)]
        initial_lr: f32,

        #[arg(long, default_value_t = 0.1)]
        decayed_lr: f32,

        /// Iteration at which the learning rate decays.
        #[arg(long, default_value_t = 180)]
        decay_at: usize,

        /// Start from random noise instead of the content image.
        #[arg(long)]
        init_random: bool,

        #[arg(long)]
        snapshot_every: Option<usize>,

        #[arg(long)]
        seed: Option<u64>,

        #[arg(short, long, default_value = "styled.png")]
        output: PathBuf,
    },
}

#[derive(Debug, Clone, Display)]
pub enum Model {
    #[strum(serialize = "squeezenet")]
    Squeezenet,
    #[strum(serialize = "resnet18")]
    Resnet18,
}

impl FromStr for Model {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "squeezenet" => Ok(Self::Squeezenet),
            "resnet18" => Ok(Self::Resnet18),
            _ if s.starts_with('s') => Ok(Self::Squeezenet),
            _ if s.starts_with('r') => Ok(Self::Resnet18),
            _ => Err(format!("Invalid model name: {}", s)),
        }
    }
}

impl Model {
    /// Content layer used by the style subcommand when none is given.
    /// The names follow the MXNet export of the model zoo checkpoints.
    pub fn default_content_layer(&self) -> &'static str {
        match self {
            Model::Squeezenet => "squeezenet0_relu11_fwd",
            Model::Resnet18 => "resnetv22_stage3_activation1",
        }
    }

    /// Style layers used by the style subcommand when none are given.
    pub fn default_style_layers(&self) -> Vec<(&'static str, f32)> {
        match self {
            Model::Squeezenet => vec![
                ("squeezenet0_relu0_fwd", 300_000.0),
                ("squeezenet0_relu4_fwd", 1000.0),
                ("squeezenet0_relu8_fwd", 15.0),
                ("squeezenet0_relu10_fwd", 3.0),
            ],
            Model::Resnet18 => vec![
                ("resnetv22_relu0_fwd", 300_000.0),
                ("resnetv22_stage1_activation1", 1000.0),
                ("resnetv22_stage2_activation1", 15.0),
                ("resnetv22_stage3_activation1", 3.0),
            ],
        }
    }
}
