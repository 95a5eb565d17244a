// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::{Path, PathBuf};
use std::time::Duration;

use canonical_error::{
    failed_precondition_error, CanonicalError, CanonicalErrorCode,
};
use clap::{Parser, Subcommand};
use log::{error, info};

use platesync_cli::capture::CommandCapture;
use platesync_cli::config::Profile;
use platesync_cli::fits;
use platesync_cli::goto_engine::{
    GotoEngine, GotoParams, MeridianMode, MeridianPolicy,
};
use platesync_cli::lx200_mount::Lx200Mount;
use platesync_cli::solver_select::{make_solver, EngineConfig, SolverKind};
use platesync_cli::telescope::TelescopeSession;
use platesync_elements::capture_trait::CaptureTrait;
use platesync_elements::sky_position::{
    parse_dec_dms, parse_ra_hms, Epoch, SkyPosition,
};
use platesync_elements::solver_trait::{PlateSolution, SolveRequest, SolverTrait};

#[derive(Parser, Debug)]
#[command(name = "platesync", version,
          about = "Plate solving and telescope pointing correction")]
struct Args {
    #[command(subcommand)]
    operation: Operation,

    /// Settings profile: a name under ~/.config/platesync/, or a TOML path.
    #[arg(long)]
    profile: Option<String>,

    /// Which solving engine to use.
    #[arg(long, value_enum)]
    solver: Option<SolverKind>,

    /// Path to the solve-field executable.
    #[arg(long)]
    solve_field_path: Option<PathBuf>,

    /// Path to the ASTAP executable.
    #[arg(long)]
    astap_path: Option<PathBuf>,

    /// Path to the PlateSolve2 executable.
    #[arg(long)]
    platesolve2_path: Option<PathBuf>,

    /// host:port of the mount's LX200 TCP endpoint.
    #[arg(long)]
    mount_addr: Option<String>,

    /// Capture command; "{}" is replaced by the output path.
    #[arg(long)]
    capture_cmd: Option<String>,

    /// Unbinned image scale, arcseconds per pixel.
    #[arg(long)]
    pixel_scale: Option<f64>,

    /// Downsampling factor passed to the engine.
    #[arg(long)]
    downsample: Option<u32>,

    /// Search radius around the pointing hint, degrees.
    #[arg(long)]
    search_radius: Option<f64>,

    /// Per-attempt solve timeout, seconds.
    #[arg(long)]
    solve_timeout: Option<u64>,

    /// Pointing convergence threshold, arcseconds.
    #[arg(long)]
    threshold: Option<f64>,

    /// Maximum capture/solve attempts per goto.
    #[arg(long)]
    max_tries: Option<u32>,

    /// Mount settling timeout after a slew, seconds.
    #[arg(long)]
    settle_timeout: Option<u64>,

    /// Refuse syncs that would move the model more than this, degrees.
    #[arg(long)]
    max_sync_separation: Option<f64>,

    /// Solve and report, but never sync the mount.
    #[arg(long)]
    no_sync: bool,

    /// Behavior when the target is near the meridian.
    #[arg(long, value_enum)]
    meridian_policy: Option<MeridianMode>,

    /// Meridian guard zone half width, minutes of hour angle.
    #[arg(long)]
    meridian_window: Option<f64>,

    /// Site longitude, degrees positive east (for the meridian policy).
    #[arg(long)]
    site_longitude: Option<f64>,

    /// Interpret RA/DEC arguments as JNOW instead of J2000.
    #[arg(long)]
    jnow: bool,

    /// Emit results as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Write results to this file instead of stdout.
    #[arg(long)]
    outfile: Option<PathBuf>,

    /// Allow --outfile to overwrite an existing file.
    #[arg(long)]
    force: bool,
}

#[derive(Subcommand, Debug)]
enum Operation {
    /// Plate solve an image file and report where it points.
    Solve {
        /// Image to solve (FITS headers are mined for hints).
        file: PathBuf,
    },
    /// Report the mount's current pointing.
    Getpos,
    /// Slew the mount to RA/DEC and wait for it to settle. No refinement.
    Slew { ra: String, dec: String },
    /// Capture an image, solve it, and sync the mount to the solution.
    Sync,
    /// Slew to RA/DEC, then capture/solve/sync until pointing converges.
    Slewsolve { ra: String, dec: String },
}

/// Profile settings with command line overrides applied.
struct Settings {
    args: Args,
    profile: Profile,
}

impl Settings {
    fn resolve(args: Args) -> Result<Settings, CanonicalError> {
        let profile = match &args.profile {
            Some(selector) => Profile::load(selector)?,
            None => Profile::default(),
        };
        Ok(Settings { args, profile })
    }

    fn solver_kind(&self) -> Result<SolverKind, CanonicalError> {
        if let Some(kind) = self.args.solver {
            return Ok(kind);
        }
        match &self.profile.solver {
            Some(name) => SolverKind::from_name(name).map_err(
                |e| failed_precondition_error(e.message.as_str())),
            None => Err(failed_precondition_error(
                "no solver selected; pass --solver or set one in the \
                 profile")),
        }
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            solve_field_path: self.args.solve_field_path.clone()
                .or_else(|| self.profile.solve_field_path.clone()),
            astap_path: self.args.astap_path.clone()
                .or_else(|| self.profile.astap_path.clone()),
            platesolve2_path: self.args.platesolve2_path.clone()
                .or_else(|| self.profile.platesolve2_path.clone()),
            platesolve2_regions: self.profile.platesolve2_regions,
        }
    }

    fn make_solver(&self)
                   -> Result<Box<dyn SolverTrait + Send + Sync>,
                             CanonicalError> {
        Ok(make_solver(self.solver_kind()?, &self.engine_config()))
    }

    fn base_request(&self) -> SolveRequest {
        SolveRequest {
            pixel_scale: self.args.pixel_scale.or(self.profile.pixel_scale),
            downsample: self.args.downsample.or(self.profile.downsample),
            search_radius: self.args.search_radius
                .or(self.profile.search_radius),
            timeout: self.args.solve_timeout
                .or(self.profile.solve_timeout_secs)
                .map(Duration::from_secs),
            ..Default::default()
        }
    }

    fn max_sync_separation_deg(&self) -> f64 {
        self.args.max_sync_separation
            .or(self.profile.max_sync_separation_deg)
            .unwrap_or(5.0)
    }

    fn make_session(&self) -> Result<TelescopeSession, CanonicalError> {
        let addr = self.args.mount_addr.clone()
            .or_else(|| self.profile.mount_addr.clone())
            .ok_or_else(|| failed_precondition_error(
                "mount address not configured; pass --mount-addr or set \
                 mount_addr in the profile"))?;
        Ok(TelescopeSession::new(Box::new(Lx200Mount::new(addr)),
                                 self.max_sync_separation_deg()))
    }

    fn make_capture(&self)
                    -> Result<Box<dyn CaptureTrait + Send>, CanonicalError> {
        let command = self.args.capture_cmd.clone()
            .or_else(|| self.profile.capture_command.clone())
            .ok_or_else(|| failed_precondition_error(
                "capture command not configured; pass --capture-cmd or set \
                 capture_command in the profile"))?;
        Ok(Box::new(CommandCapture::new(
            command, Duration::from_secs(120))?))
    }

    fn meridian_policy(&self) -> Result<MeridianPolicy, CanonicalError> {
        let mut policy = MeridianPolicy::default();
        if let Some(name) = &self.profile.meridian_mode {
            policy.mode = parse_meridian_mode(name)?;
        }
        if let Some(mode) = self.args.meridian_policy {
            policy.mode = mode;
        }
        if let Some(window) = self.args.meridian_window
            .or(self.profile.meridian_window_minutes)
        {
            policy.window_minutes = window;
        }
        if let Some(longitude) = self.args.site_longitude
            .or(self.profile.site_longitude_deg)
        {
            policy.site_longitude_deg = longitude;
        } else if policy.mode != MeridianMode::Ignore {
            return Err(failed_precondition_error(
                "meridian policy needs the site longitude; pass \
                 --site-longitude or set site_longitude_deg in the profile"));
        }
        Ok(policy)
    }

    fn goto_params(&self) -> Result<GotoParams, CanonicalError> {
        let defaults = GotoParams::default();
        Ok(GotoParams {
            threshold_arcsec: self.args.threshold
                .or(self.profile.threshold_arcsec)
                .unwrap_or(defaults.threshold_arcsec),
            max_tries: self.args.max_tries
                .or(self.profile.max_tries)
                .unwrap_or(defaults.max_tries),
            settle_timeout: self.args.settle_timeout
                .or(self.profile.settle_timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.settle_timeout),
            sync_enabled: !self.args.no_sync,
            meridian: self.meridian_policy()?,
        })
    }

    fn target_epoch(&self) -> Epoch {
        if self.args.jnow { Epoch::Jnow } else { Epoch::J2000 }
    }
}

fn parse_meridian_mode(name: &str) -> Result<MeridianMode, CanonicalError> {
    match name {
        "ignore" => Ok(MeridianMode::Ignore),
        "pause-before" => Ok(MeridianMode::PauseBefore),
        "pause-after" => Ok(MeridianMode::PauseAfter),
        _ => Err(failed_precondition_error(
            format!("unknown meridian mode '{}'; expected ignore, \
                     pause-before, or pause-after", name).as_str())),
    }
}

fn parse_target(ra: &str, dec: &str, epoch: Epoch)
                -> Result<SkyPosition, CanonicalError> {
    Ok(SkyPosition::new(parse_ra_hms(ra)?, parse_dec_dms(dec)?, epoch))
}

fn position_json(position: &SkyPosition) -> serde_json::Value {
    serde_json::json!({
        "ra2000": position.ra_deg(),
        "dec2000": position.dec_deg,
        "ra2000_hms": position.format_ra_hms(),
        "dec2000_dms": position.format_dec_dms(),
    })
}

fn solution_json(solution: &PlateSolution) -> serde_json::Value {
    let mut value = position_json(&solution.coord);
    let fields = value.as_object_mut().unwrap();
    fields.insert("fov_x_deg".to_string(), solution.fov_x_deg.into());
    fields.insert("fov_y_deg".to_string(), solution.fov_y_deg.into());
    fields.insert("pixelscale".to_string(),
                  solution.pixel_scale_arcsec.into());
    fields.insert("angle".to_string(), solution.rotation_deg.into());
    value
}

fn solution_text(solution: &PlateSolution) -> String {
    let mut text = format!("Solved center: {}\n", solution.coord);
    text.push_str(&format!("Field of view: {:.3} x {:.3} deg\n",
                           solution.fov_x_deg, solution.fov_y_deg));
    if let Some(scale) = solution.pixel_scale_arcsec {
        text.push_str(&format!("Pixel scale: {:.3}\"/px\n", scale));
    }
    if let Some(angle) = solution.rotation_deg {
        text.push_str(&format!("Rotation: {:.2} deg E of N\n", angle));
    }
    text
}

// Emits a result either to stdout or to --outfile. Refuses to clobber an
// existing file unless --force.
fn emit(settings: &Settings, text: &str) -> Result<(), CanonicalError> {
    match &settings.args.outfile {
        None => {
            print!("{}", text);
            if !text.ends_with('\n') {
                println!();
            }
            Ok(())
        }
        Some(path) => {
            if path.exists() && !settings.args.force {
                return Err(failed_precondition_error(
                    format!("{:?} exists; pass --force to overwrite",
                            path).as_str()));
            }
            std::fs::write(path, text).map_err(
                |e| failed_precondition_error(
                    format!("cannot write {:?}: {}", path, e).as_str()))
        }
    }
}

fn emit_json(settings: &Settings, value: &serde_json::Value)
             -> Result<(), CanonicalError> {
    emit(settings, &format!("{:#}\n", value))
}

async fn cmd_solve(settings: &Settings, file: &Path)
                   -> Result<(), CanonicalError> {
    let solver = settings.make_solver()?;
    let mut request = settings.base_request();
    request.image = file.to_path_buf();
    fits::apply_header_hints(&mut request);
    let solution = solver.solve_image(&request).await?;
    if settings.args.json {
        emit_json(settings, &solution_json(&solution))
    } else {
        emit(settings, &solution_text(&solution))
    }
}

async fn cmd_getpos(settings: &Settings) -> Result<(), CanonicalError> {
    let mut session = settings.make_session()?;
    session.connect().await?;
    let j2000 = session.get_position(Epoch::J2000).await?;
    let jnow = session.get_position(Epoch::Jnow).await?;
    session.disconnect().await;
    if settings.args.json {
        let mut value = position_json(&j2000);
        let fields = value.as_object_mut().unwrap();
        fields.insert("ra_jnow".to_string(), jnow.ra_deg().into());
        fields.insert("dec_jnow".to_string(), jnow.dec_deg.into());
        emit_json(settings, &value)
    } else {
        emit(settings, &format!("Mount position: {}\n                {}\n",
                                j2000, jnow))
    }
}

async fn cmd_slew(settings: &Settings, ra: &str, dec: &str)
                  -> Result<(), CanonicalError> {
    let target = parse_target(ra, dec, settings.target_epoch())?;
    let params = settings.goto_params()?;
    let mut session = settings.make_session()?;
    session.connect().await?;
    let result = async {
        session.slew_to(&target).await?;
        session.wait_until_idle(params.settle_timeout).await?;
        session.get_position(Epoch::J2000).await
    }.await;
    session.disconnect().await;
    let position = result?;
    info!("slew complete");
    if settings.args.json {
        emit_json(settings, &position_json(&position))
    } else {
        emit(settings, &format!("Mount position: {}\n", position))
    }
}

async fn cmd_sync(settings: &Settings) -> Result<(), CanonicalError> {
    let solver = settings.make_solver()?;
    let mut capture = settings.make_capture()?;
    let mut session = settings.make_session()?;
    session.connect().await?;
    let result = async {
        let mut request = settings.base_request();
        request.image = capture.capture_image().await?;
        request.hint = Some(session.get_position(Epoch::J2000).await?);
        fits::apply_header_hints(&mut request);
        let solution = solver.solve_image(&request).await?;
        if !settings.args.no_sync {
            session.sync_to(&solution.coord).await?;
            info!("mount synced to solved position");
        }
        Ok(solution)
    }.await;
    session.disconnect().await;
    let solution = result?;
    if settings.args.json {
        emit_json(settings, &solution_json(&solution))
    } else {
        emit(settings, &solution_text(&solution))
    }
}

async fn cmd_slewsolve(settings: &Settings, ra: &str, dec: &str)
                       -> Result<(), CanonicalError> {
    let target = parse_target(ra, dec, settings.target_epoch())?;
    let solver = settings.make_solver()?;
    let mut capture = settings.make_capture()?;
    let mut session = settings.make_session()?;
    session.connect().await?;
    let result = async {
        let mut engine = GotoEngine::new(
            &mut session, solver.as_ref(), capture.as_mut(),
            settings.base_request(), settings.goto_params()?);
        engine.run(&target).await
    }.await;
    let outcome = match result {
        Ok(goto) => session.get_position(Epoch::J2000).await
            .map(|position| (goto, position)),
        Err(e) => Err(e),
    };
    session.disconnect().await;
    let (goto, position) = outcome?;
    info!("pointing converged after {} tries, residual {:.1}\"",
          goto.tries, goto.final_separation_arcsec);
    if settings.args.json {
        let mut value = position_json(&position);
        let fields = value.as_object_mut().unwrap();
        fields.insert("tries".to_string(), goto.tries.into());
        fields.insert("residual_arcsec".to_string(),
                      goto.final_separation_arcsec.into());
        emit_json(settings, &value)
    } else {
        emit(settings, &format!(
            "Converged after {} tries; residual {:.1}\"\n\
             Mount position: {}\n",
            goto.tries, goto.final_separation_arcsec, position))
    }
}

async fn run(settings: &Settings) -> Result<(), CanonicalError> {
    match &settings.args.operation {
        Operation::Solve { file } => cmd_solve(settings, file).await,
        Operation::Getpos => cmd_getpos(settings).await,
        Operation::Slew { ra, dec } => cmd_slew(settings, ra, dec).await,
        Operation::Sync => cmd_sync(settings).await,
        Operation::Slewsolve { ra, dec } =>
            cmd_slewsolve(settings, ra, dec).await,
    }
}

// Shell exit codes, stable for scripting.
fn exit_code(code: CanonicalErrorCode) -> i32 {
    match code {
        CanonicalErrorCode::FailedPrecondition => 2,
        CanonicalErrorCode::Unavailable => 3,
        CanonicalErrorCode::Aborted => 4,
        CanonicalErrorCode::NotFound => 5,
        CanonicalErrorCode::InvalidArgument => 5,
        CanonicalErrorCode::DeadlineExceeded => 6,
        CanonicalErrorCode::ResourceExhausted => 7,
        _ => 1,
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let result = match Settings::resolve(args) {
        Ok(settings) => run(&settings).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        error!("{}", e.message);
        std::process::exit(exit_code(e.code));
    }
}
