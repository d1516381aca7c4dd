//! Command line front end.
//!
//! ```bash
//! image-matcher solve --correspondences samples/correspondences.csv \
//!   --camera samples/tracking_camera.yaml --width 1920 --height 1080
//! image-matcher calibrate --correspondences samples/correspondences.csv \
//!   --width 1920 --height 1080 --refine focal-length,k1 --output refined.yaml
//! image-matcher export --correspondences samples/correspondences.csv \
//!   --width 1920 --height 1080 --mode converted --output matches.json
//! ```

use clap::{Args, Parser, Subcommand, ValueEnum};
use flexi_logger::{colored_detailed_format, detailed_format, Duplicate, FileSpec, Logger};
use image_matcher::camera::{CameraModel, Resolution, TrackingCamera};
use image_matcher::export::{self, CameraRecord, ExportMode};
use image_matcher::optimization::{CalibrationFlags, SolverOptions};
use image_matcher::scene::RenderSettings;
use image_matcher::session::Session;
use image_matcher::{coordinates, util};
use log::{error, info, warn};
use std::path::PathBuf;

/// Camera pose and calibration from hand-picked 2D-3D point matches
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level filter, e.g. "info" or "image_matcher=debug"
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Solve the camera pose with known intrinsics
    Solve {
        #[command(flatten)]
        input: InputArgs,

        /// Save an overlay of observed and reprojected points (needs --image)
        #[arg(long)]
        reprojection: Option<PathBuf>,
    },
    /// Refine the camera intrinsics
    Calibrate {
        #[command(flatten)]
        input: InputArgs,

        /// Parameters to refine
        #[arg(long, value_enum, value_delimiter = ',', default_value = "focal-length")]
        refine: Vec<Parameter>,

        /// Where to write the refined tracking camera (YAML)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Where to write the refined pinhole model (YAML)
        #[arg(long)]
        pinhole_output: Option<PathBuf>,
    },
    /// Solve the pose and export the camera as JSON
    Export {
        #[command(flatten)]
        input: InputArgs,

        #[arg(short, long, value_enum, default_value = "native")]
        mode: Mode,

        /// Output file, ".json" is appended when missing
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(Args, Debug)]
struct InputArgs {
    /// CSV file with `u,v,x,y,z` rows
    #[arg(short, long)]
    correspondences: PathBuf,

    /// Tracking camera YAML; defaults to a 50 mm lens centred on the image
    #[arg(long)]
    camera: Option<PathBuf>,

    /// Image file, used for its size
    #[arg(short, long)]
    image: Option<PathBuf>,

    #[arg(long, requires = "height", conflicts_with = "image")]
    width: Option<u32>,

    #[arg(long, requires = "width", conflicts_with = "image")]
    height: Option<u32>,

    /// Solver settings YAML
    #[arg(long)]
    options: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Parameter {
    FocalLength,
    PrincipalPoint,
    K1,
    K2,
    K3,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    Native,
    Converted,
}

impl From<Mode> for ExportMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Native => ExportMode::Native,
            Mode::Converted => ExportMode::Converted,
        }
    }
}

fn calibration_flags(parameters: &[Parameter]) -> CalibrationFlags {
    CalibrationFlags {
        refine_focal_length: parameters.contains(&Parameter::FocalLength),
        refine_principal_point: parameters.contains(&Parameter::PrincipalPoint),
        refine_k1: parameters.contains(&Parameter::K1),
        refine_k2: parameters.contains(&Parameter::K2),
        refine_k3: parameters.contains(&Parameter::K3),
    }
}

fn path_str(path: &std::path::Path) -> Result<&str, Box<dyn std::error::Error>> {
    Ok(path.to_str().ok_or("Invalid path string")?)
}

/// Builds a one-image session from the command line inputs.
fn load_session(input: &InputArgs) -> Result<Session, Box<dyn std::error::Error>> {
    let mut session = Session::new();
    if let Some(options) = &input.options {
        session.options = SolverOptions::load_from_yaml(path_str(options)?)?;
    }

    let index = match (&input.image, input.width, input.height) {
        (Some(image), _, _) => session.add_image(image)?,
        (None, Some(width), Some(height)) => {
            let name = input
                .correspondences
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "image".to_string());
            session.add_image_with_resolution(name, Resolution::new(width, height))?
        }
        _ => return Err("Either --image or --width and --height are required".into()),
    };

    let image = &mut session.image_matches[index];
    session.render = RenderSettings::for_image(&image.resolution);
    if let Some(camera) = &input.camera {
        image.tracking_camera = TrackingCamera::load_from_yaml(path_str(camera)?)?;
    }
    image.point_matches = util::read_point_matches(&input.correspondences)?;
    info!(
        "Loaded {} point matches ({} complete) for {}",
        image.point_matches.len(),
        image.point_matches.num_complete(),
        image.name
    );

    Ok(session)
}

fn run(command: Command) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Solve {
            input,
            reprojection,
        } => {
            let mut session = load_session(&input)?;
            let report = session.solve_active_pose()?;
            if !report.solution.converged {
                error!("{}", report.solution.message);
                return Err(report.solution.message.into());
            }

            let image = session.active_image().ok_or("No active image")?;
            let transform = image.camera.transform;
            println!("{}", report.solution.message);
            println!("Camera location: {:?}", transform.location.as_slice());
            println!(
                "Camera quaternion (w, x, y, z): {:?}",
                coordinates::quaternion_native(&transform.quaternion())
            );

            let correspondences = &report.correspondences;
            let statistics = util::compute_reprojection_error(
                &report.camera,
                &report.solution.rotation,
                &report.solution.translation,
                &correspondences.points_3d,
                &correspondences.points_2d,
            )?;
            info!("{statistics:?}");

            if let Some(output) = reprojection {
                let image_path = input
                    .image
                    .as_ref()
                    .ok_or("--reprojection needs --image")?;
                util::save_reprojection_image(
                    image_path,
                    &correspondences.points_2d,
                    &report.solution.reprojected_points,
                    &output,
                )?;
                info!("Saved reprojection overlay to {}", output.display());
            }
        }
        Command::Calibrate {
            input,
            refine,
            output,
            pinhole_output,
        } => {
            let mut session = load_session(&input)?;
            session.flags = calibration_flags(&refine);
            let report = session.calibrate_active()?;
            for warning in &report.warnings {
                warn!("{warning}");
            }

            let model = report.solution.model;
            println!("{}", report.solution.message);
            println!("Intrinsics: {:?}", model.get_intrinsics());
            println!("Distortion: {:?}", model.get_distortion());

            let image = session.active_image().ok_or("No active image")?;
            if let Some(output) = output {
                image.tracking_camera.save_to_yaml(path_str(&output)?)?;
                info!("Saved tracking camera to {}", output.display());
            }
            if let Some(output) = pinhole_output {
                model.save_to_yaml(path_str(&output)?)?;
                info!("Saved pinhole model to {}", output.display());
            }
        }
        Command::Export {
            input,
            mode,
            output,
        } => {
            let mut session = load_session(&input)?;
            let report = session.solve_active_pose()?;
            if !report.solution.converged {
                return Err(report.solution.message.into());
            }

            // No reference model on the command line, so no centre point.
            let records: Vec<CameraRecord> = session
                .image_matches
                .iter()
                .map(|image| CameraRecord {
                    camera: image.camera.clone(),
                    ground_intersection: None,
                    image_filename: image.name.clone(),
                })
                .collect();
            let document = export::serialize(&records, mode.into(), &session.render)?;
            let written = export::write_json(&document, &output)?;
            println!("Exported to {}", written.display());
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    Logger::try_with_env_or_str(&cli.log_level)?
        .log_to_file(
            FileSpec::default()
                .directory("logs")
                .suppress_timestamp()
                .suffix("log"),
        )
        .duplicate_to_stdout(Duplicate::All)
        .format_for_files(detailed_format)
        .format_for_stdout(colored_detailed_format)
        // error;warn;info;debug;trace
        .set_palette("196;208;76;39;178".to_string())
        .start()?;

    run(cli.command).inspect_err(|e| error!("{e}"))
}
