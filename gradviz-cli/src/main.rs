use std::path::{Path, PathBuf};

use clap::Parser;
use log::info;

use gradviz::service::labels::Labels;
use gradviz::service::utility::read_and_prepare_images;
use gradviz::service::{prepare, Config, InferenceOutput, Service, ServiceBuilder, ServiceError};
use gradviz::vis::dream::{class_visualization, ClassVisConfig, Snapshot};
use gradviz::vis::fooling::{make_fooling_image, FoolingConfig};
use gradviz::vis::saliency::saliency_maps;
use gradviz::vis::style::{style_transfer, StyleConfig};
use gradviz::vis::VisError;
use ndarray::Axis;

mod cli;
use cli::{Args, Command};
use thiserror::Error;

#[derive(Debug, Error)]
enum AppError {
    #[error("Runtime failure -> {0}")]
    RuntimeFailure(#[from] ServiceError),
    #[error("Visualization failure -> {0}")]
    VisualizationFailure(#[from] VisError),
    #[error("Could not read the label file -> {0}")]
    UnreadableLabels(std::io::Error),
    #[error("Could not decode image -> {0}")]
    CouldNotDecodeImage(image::ImageError),
    #[error("Could not save {path}: {source}")]
    CouldNotSaveImage {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("Expected one label per image: {images} images, {labels} labels")]
    MismatchedLabels { images: usize, labels: usize },
    #[error(
        "The fooling loop did not converge after {iterations} iterations \
         (still classified as {predicted})"
    )]
    DidNotConverge {
        iterations: usize,
        predicted: String,
    },
}

fn main() {
    if let Err(e) = exec_program() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn exec_program() -> Result<(), AppError> {
    env_logger::init();

    let args = Args::parse();

    let model_proto_path = format!("models/{}.onnx", args.model);
    let labels = load_labels(args.labels.as_deref())?;

    info!("Model path: {}", model_proto_path);
    info!("Number of threads: {}", args.threads);

    let config = Config {
        num_threads: args.threads.into(),
    };
    let service = ServiceBuilder::new(model_proto_path.into())
        .config(config)
        .build()?;

    info!("Service created successfully");

    match args.command {
        Command::Classify { input, show } => classify(&service, &labels, input, show.into()),
        Command::Layers => {
            for name in service.network().layer_names() {
                println!("{name}");
            }
            Ok(())
        }
        Command::Saliency {
            input,
            label,
            output,
        } => saliency(&service, input, label, &output),
        Command::Fool {
            input,
            target,
            step_size,
            max_iterations,
            output,
        } => fool(
            &service,
            &labels,
            input,
            target,
            FoolingConfig {
                step_size,
                max_iterations,
            },
            &output,
        ),
        Command::Dream {
            target,
            learning_rate,
            l2_reg,
            iterations,
            blur_every,
            max_jitter,
            size,
            snapshot_every,
            seed,
            output,
        } => dream(
            &service,
            &labels,
            target,
            ClassVisConfig {
                learning_rate,
                l2_reg,
                num_iterations: iterations,
                blur_every,
                max_jitter,
                image_size: size,
                snapshot_every,
                seed,
                ..Default::default()
            },
            &output,
        ),
        Command::Style {
            content,
            style,
            size,
            content_layer,
            content_weight,
            style_layer,
            style_weight,
            tv_weight,
            iterations,
            initial_lr,
            decayed_lr,
            decay_at,
            init_random,
            snapshot_every,
            seed,
            output,
        } => {
            let (style_layers, style_weights) = if style_layer.is_empty() {
                let defaults = args.model.default_style_layers();
                (
                    defaults.iter().map(|(l, _)| String::from(*l)).collect(),
                    defaults.iter().map(|(_, w)| *w).collect(),
                )
            } else {
                (style_layer, style_weight)
            };
            let config = StyleConfig {
                content_layer: content_layer
                    .unwrap_or_else(|| String::from(args.model.default_content_layer())),
                content_weight,
                style_layers,
                style_weights,
                tv_weight,
                iterations,
                initial_lr,
                decayed_lr,
                decay_at,
                init_random,
                snapshot_every,
                seed,
                ..Default::default()
            };
            run_style(&service, content, style, size, config, &output)
        }
    }
}

fn load_labels(path: Option<&Path>) -> Result<Labels, AppError> {
    match path {
        Some(path) => Labels::from_file(path).map_err(AppError::UnreadableLabels),
        None => {
            let default = Path::new("models/synset.txt");
            if default.exists() {
                Labels::from_file(default).map_err(AppError::UnreadableLabels)
            } else {
                Ok(Labels::empty())
            }
        }
    }
}

fn classify(
    service: &Service,
    labels: &Labels,
    input: Vec<PathBuf>,
    k: usize,
) -> Result<(), AppError> {
    let result = service.prepare_and_run(input)?;
    print_top_k_batch_predictions(&result, labels, k);
    Ok(())
}

fn saliency(
    service: &Service,
    input: Vec<PathBuf>,
    label: Vec<usize>,
    output_prefix: &str,
) -> Result<(), AppError> {
    let images = read_and_prepare_images(input.as_slice())?;

    // fall back to the model's own predictions when no labels are given
    let labels = if label.is_empty() {
        service
            .classify(&images)?
            .get_top_k_predictions(1)
            .into_iter()
            .flatten()
            .map(|prediction| prediction.class_index)
            .collect()
    } else if label.len() == images.shape()[0] {
        label
    } else {
        return Err(AppError::MismatchedLabels {
            images: images.shape()[0],
            labels: label.len(),
        });
    };

    let maps = saliency_maps(service, &images, &labels)?;
    for (index, map) in maps.axis_iter(Axis(0)).enumerate() {
        let path = PathBuf::from(format!("{output_prefix}{index}.png"));
        let rendered = prepare::saliency_to_image(&map.to_owned());
        rendered
            .save(&path)
            .map_err(|source| AppError::CouldNotSaveImage { path: path.clone(), source })?;
        info!("Saliency map written to {}", path.display());
    }
    Ok(())
}

fn fool(
    service: &Service,
    labels: &Labels,
    input: PathBuf,
    target: usize,
    config: FoolingConfig,
    output: &Path,
) -> Result<(), AppError> {
    let image = read_and_prepare_images(&[input])?;
    let result = make_fooling_image(service, &image, target, &config)?;

    if !result.converged {
        return Err(AppError::DidNotConverge {
            iterations: result.iterations,
            predicted: labels.name(result.predicted_class),
        });
    }
    println!(
        "Fooled the model into predicting \"{}\" after {} steps",
        labels.name(result.predicted_class),
        result.iterations
    );

    save_batch_element(&result.image, output)?;
    Ok(())
}

fn dream(
    service: &Service,
    labels: &Labels,
    target: usize,
    config: ClassVisConfig,
    output: &Path,
) -> Result<(), AppError> {
    let result = class_visualization(service, target, &config)?;
    println!(
        "Synthesized \"{}\" with final score {}",
        labels.name(target),
        result.final_score
    );

    save_snapshots(&result.snapshots, output)?;
    save_batch_element(&result.image, output)?;
    Ok(())
}

fn run_style(
    service: &Service,
    content: PathBuf,
    style: PathBuf,
    size: u32,
    config: StyleConfig,
    output: &Path,
) -> Result<(), AppError> {
    let content_image = image::open(content).map_err(AppError::CouldNotDecodeImage)?;
    let style_image = image::open(style).map_err(AppError::CouldNotDecodeImage)?;
    let content_tensor = prepare::preprocessing_scaled(&content_image, size);
    let style_tensor = prepare::preprocessing_scaled(&style_image, size);

    let result = style_transfer(service, &content_tensor, &style_tensor, &config)?;
    println!("Style transfer finished with loss {}", result.final_loss);

    save_snapshots(&result.snapshots, output)?;
    save_batch_element(&result.image, output)?;
    Ok(())
}

fn save_snapshots(snapshots: &[Snapshot], output: &Path) -> Result<(), AppError> {
    for snapshot in snapshots {
        let stem = output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| String::from("snapshot"));
        let path = output.with_file_name(format!("{}-{:04}.png", stem, snapshot.iteration));
        save_batch_element(&snapshot.image, &path)?;
    }
    Ok(())
}

fn save_batch_element(batch: &ndarray::Array4<f32>, path: &Path) -> Result<(), AppError> {
    let rendered = prepare::deprocess(batch, 0);
    rendered
        .save(path)
        .map_err(|source| AppError::CouldNotSaveImage {
            path: path.to_path_buf(),
            source,
        })?;
    info!("Image written to {}", path.display());
    Ok(())
}

fn print_top_k_batch_predictions(output: &InferenceOutput, labels: &Labels, k: usize) {
    println!("Top {} predictions:", k);
    for (i, image_prediction) in output.get_top_k_predictions(k).into_iter().enumerate() {
        println!("  Image #{}", i + 1);
        for (rank, prediction) in image_prediction.iter().enumerate() {
            println!(
                "    {}. class: {}, probability: {} %",
                rank + 1,
                labels.name(prediction.class_index),
                prediction.probability * 100_f32
            );
        }
    }
}
