// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::{Duration, SystemTime};

use canonical_error::{
    resource_exhausted_error, CanonicalError, CanonicalErrorCode,
};
use clap::ValueEnum;
use log::{info, warn};

use platesync_elements::astro_util::hour_angle;
use platesync_elements::capture_trait::CaptureTrait;
use platesync_elements::sky_position::{Epoch, SkyPosition};
use platesync_elements::solver_trait::{SolveRequest, SolverTrait};

use crate::fits;
use crate::telescope::TelescopeSession;

/// What to do when the goto target is near the meridian, where German
/// equatorial mounts flip sides and ruin pointing repeatability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MeridianMode {
    /// Slew regardless of the target's hour angle.
    Ignore,
    /// If the target is about to cross the meridian, wait for it to cross
    /// before slewing, so the whole refinement runs on one pier side.
    PauseBefore,
    /// Wait until the target is a full window past the meridian.
    PauseAfter,
}

#[derive(Debug, Clone, Copy)]
pub struct MeridianPolicy {
    pub mode: MeridianMode,
    // Half width of the guard zone around the meridian, in minutes of
    // hour angle.
    pub window_minutes: f64,
    // Positive east, needed to compute the target's hour angle.
    pub site_longitude_deg: f64,
}

impl Default for MeridianPolicy {
    fn default() -> Self {
        MeridianPolicy {
            mode: MeridianMode::Ignore,
            window_minutes: 5.0,
            site_longitude_deg: 0.0,
        }
    }
}

/// How long to wait, if at all, before slewing to a target at the given hour
/// angle (radians, negative east of the meridian).
pub fn meridian_delay(mode: MeridianMode, hour_angle_rad: f64,
                      window_minutes: f64) -> Option<Duration> {
    let ha_minutes = hour_angle_rad.to_degrees() / 15.0 * 60.0;
    let pause_minutes = match mode {
        MeridianMode::Ignore => return None,
        MeridianMode::PauseBefore => {
            if ha_minutes >= -window_minutes && ha_minutes < 0.0 {
                -ha_minutes
            } else {
                return None;
            }
        }
        MeridianMode::PauseAfter => {
            if ha_minutes >= -window_minutes && ha_minutes < window_minutes {
                window_minutes - ha_minutes
            } else {
                return None;
            }
        }
    };
    // Sidereal minutes are close enough to clock minutes here; pad a little
    // so we come out on the far side.
    Some(Duration::from_secs_f64(pause_minutes * 60.0 + 5.0))
}

#[derive(Debug, Clone, Copy)]
pub struct GotoParams {
    // Pointing is converged once the solved center is within this of the
    // target.
    pub threshold_arcsec: f64,
    // Solve attempts before giving up. Each try is one capture and one
    // solve.
    pub max_tries: u32,
    // How long to wait for the mount to stop moving after a slew.
    pub settle_timeout: Duration,
    // When false, refinement measures the pointing error but never corrects
    // the mount's model.
    pub sync_enabled: bool,
    pub meridian: MeridianPolicy,
}

impl Default for GotoParams {
    fn default() -> Self {
        GotoParams {
            threshold_arcsec: 600.0,
            max_tries: 5,
            settle_timeout: Duration::from_secs(120),
            sync_enabled: true,
            meridian: MeridianPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GotoResult {
    // Number of capture/solve attempts consumed, including the final one.
    pub tries: u32,
    pub final_separation_arcsec: f64,
}

/// Drives the slew / capture / solve / sync refinement loop: slew to the
/// target, measure where the mount actually ended up, teach the mount the
/// difference, and repeat until the residual error is within threshold.
///
/// Solve failures (no match, timeout, unparsable output) consume a try and
/// re-slew; configuration problems and mount or capture errors abort
/// immediately. Each run() starts with fresh counters, so the engine can be
/// reused for successive targets.
pub struct GotoEngine<'a> {
    session: &'a mut TelescopeSession,
    solver: &'a (dyn SolverTrait + Send + Sync),
    capture: &'a mut (dyn CaptureTrait + Send),
    // Template for each attempt's solve; image and pointing hint are filled
    // in per attempt.
    base_request: SolveRequest,
    params: GotoParams,
}

fn solve_failure_consumes_try(e: &CanonicalError) -> bool {
    matches!(e.code,
             CanonicalErrorCode::NotFound
             | CanonicalErrorCode::DeadlineExceeded
             | CanonicalErrorCode::InvalidArgument)
}

impl<'a> GotoEngine<'a> {
    pub fn new(session: &'a mut TelescopeSession,
               solver: &'a (dyn SolverTrait + Send + Sync),
               capture: &'a mut (dyn CaptureTrait + Send),
               base_request: SolveRequest,
               params: GotoParams) -> Self {
        GotoEngine { session, solver, capture, base_request, params }
    }

    async fn pause_for_meridian(&self, target: &SkyPosition) {
        let policy = &self.params.meridian;
        let now = SystemTime::now();
        let target_jnow = target.to_epoch(Epoch::Jnow, &now);
        let ha = hour_angle(target_jnow.ra_rad(),
                            policy.site_longitude_deg.to_radians(), &now);
        if let Some(delay) =
            meridian_delay(policy.mode, ha, policy.window_minutes)
        {
            info!("target is {:.1} minutes from the meridian; \
                   pausing {:.0?} before slewing",
                  ha.to_degrees() / 15.0 * 60.0, delay);
            tokio::time::sleep(delay).await;
        }
    }

    async fn slew_and_settle(&mut self, target: &SkyPosition)
                             -> Result<(), CanonicalError> {
        self.session.slew_to(target).await?;
        self.session.wait_until_idle(self.params.settle_timeout).await
    }

    /// Runs the refinement loop for `target`. On success reports how many
    /// tries it took and the final measured error; when all tries are
    /// consumed without converging, returns ResourceExhausted.
    pub async fn run(&mut self, target: &SkyPosition)
                     -> Result<GotoResult, CanonicalError> {
        let target_j2000 = target.to_epoch(Epoch::J2000, &SystemTime::now());
        info!("goto {} with threshold {:.0}\"",
              target_j2000, self.params.threshold_arcsec);

        self.pause_for_meridian(&target_j2000).await;
        self.slew_and_settle(&target_j2000).await?;

        let mut last_residual: Option<f64> = None;
        for attempt in 1..=self.params.max_tries {
            let mut request = self.base_request.clone();
            request.image = self.capture.capture_image().await?;
            request.hint =
                Some(self.session.get_position(Epoch::J2000).await?);
            fits::apply_header_hints(&mut request);

            match self.solver.solve_image(&request).await {
                Ok(solution) => {
                    let separation_arcsec =
                        solution.coord.separation_from(&target_j2000)?
                        * 3600.0;
                    info!("attempt {}: pointing is {:.1}\" from target",
                          attempt, separation_arcsec);
                    last_residual = Some(separation_arcsec);
                    if separation_arcsec <= self.params.threshold_arcsec {
                        return Ok(GotoResult {
                            tries: attempt,
                            final_separation_arcsec: separation_arcsec,
                        });
                    }
                    if self.params.sync_enabled {
                        self.session.sync_to(&solution.coord).await?;
                    }
                }
                Err(e) if solve_failure_consumes_try(&e) => {
                    warn!("attempt {}: solve failed: {}", attempt, e.message);
                }
                Err(e) => return Err(e),
            }
            if attempt < self.params.max_tries {
                self.slew_and_settle(&target_j2000).await?;
            }
        }
        let residual = match last_residual {
            Some(r) => format!("residual error {:.1}\"", r),
            None => "no successful solve".to_string(),
        };
        Err(resource_exhausted_error(
            format!("pointing did not converge within {} tries; {}",
                    self.params.max_tries, residual).as_str()))
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use approx::assert_abs_diff_eq;
    use async_trait::async_trait;
    use canonical_error::{failed_precondition_error, not_found_error};

    use platesync_elements::mount_trait::MountTrait;
    use platesync_elements::solver_trait::PlateSolution;

    use super::*;

    #[derive(Default)]
    struct FakeMountState {
        position: Option<SkyPosition>,
        slew_count: u32,
        sync_count: u32,
    }

    // Teleports instantly to any slew target; records command counts.
    #[derive(Clone, Default)]
    struct FakeMount {
        state: Arc<Mutex<FakeMountState>>,
    }

    #[async_trait]
    impl MountTrait for FakeMount {
        async fn connect(&mut self) -> Result<(), CanonicalError> {
            Ok(())
        }
        async fn disconnect(&mut self) {}
        fn is_connected(&self) -> bool {
            true
        }
        fn native_epoch(&self) -> Epoch {
            Epoch::J2000
        }
        async fn position(&mut self) -> Result<SkyPosition, CanonicalError> {
            Ok(self.state.lock().unwrap().position.unwrap_or(
                SkyPosition::new(0.0, 90.0, Epoch::J2000)))
        }
        async fn slew(&mut self, target: &SkyPosition)
                      -> Result<(), CanonicalError> {
            let mut state = self.state.lock().unwrap();
            state.slew_count += 1;
            state.position = Some(*target);
            Ok(())
        }
        async fn sync(&mut self, position: &SkyPosition)
                      -> Result<(), CanonicalError> {
            let mut state = self.state.lock().unwrap();
            state.sync_count += 1;
            state.position = Some(*position);
            Ok(())
        }
        async fn is_slewing(&mut self) -> Result<bool, CanonicalError> {
            Ok(false)
        }
    }

    // Plays back a queue of solve results and counts invocations.
    #[derive(Default)]
    struct ScriptedSolver {
        results: Mutex<VecDeque<Result<PlateSolution, CanonicalError>>>,
        calls: AtomicU32,
    }

    impl ScriptedSolver {
        fn push(&self, result: Result<PlateSolution, CanonicalError>) {
            self.results.lock().unwrap().push_back(result);
        }
        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SolverTrait for ScriptedSolver {
        async fn solve_image(&self, _request: &SolveRequest)
                             -> Result<PlateSolution, CanonicalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results.lock().unwrap().pop_front()
                .unwrap_or_else(|| Err(not_found_error("script exhausted")))
        }
        fn default_timeout(&self) -> Duration {
            Duration::from_secs(1)
        }
    }

    struct FakeCapture {
        count: u32,
    }

    #[async_trait]
    impl CaptureTrait for FakeCapture {
        async fn capture_image(&mut self) -> Result<PathBuf, CanonicalError> {
            self.count += 1;
            Ok(PathBuf::from("/nonexistent/capture.fits"))
        }
    }

    fn solution_at(ra_hours: f64, dec_deg: f64) -> PlateSolution {
        PlateSolution {
            coord: SkyPosition::new(ra_hours, dec_deg, Epoch::J2000),
            fov_x_deg: 1.0,
            fov_y_deg: 0.75,
            pixel_scale_arcsec: Some(1.5),
            rotation_deg: None,
            matched_stars: None,
        }
    }

    fn test_params() -> GotoParams {
        GotoParams {
            threshold_arcsec: 30.0,
            max_tries: 3,
            settle_timeout: Duration::from_secs(1),
            sync_enabled: true,
            meridian: MeridianPolicy::default(),
        }
    }

    async fn connected_session(mount: &FakeMount) -> TelescopeSession {
        let mut session = TelescopeSession::new(Box::new(mount.clone()), 5.0);
        session.connect().await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_converges_after_corrections() {
        let mount = FakeMount::default();
        let mut session = connected_session(&mount).await;
        let solver = ScriptedSolver::default();
        // Pointing error shrinks as syncs take hold: 5', then 1', then 10".
        solver.push(Ok(solution_at(10.0, 20.0 + 5.0 / 60.0)));
        solver.push(Ok(solution_at(10.0, 20.0 + 1.0 / 60.0)));
        solver.push(Ok(solution_at(10.0, 20.0 + 10.0 / 3600.0)));
        let mut capture = FakeCapture { count: 0 };

        let target = SkyPosition::new(10.0, 20.0, Epoch::J2000);
        let mut engine = GotoEngine::new(
            &mut session, &solver, &mut capture,
            SolveRequest::default(), test_params());
        let result = engine.run(&target).await.unwrap();
        assert_eq!(result.tries, 3);
        assert_abs_diff_eq!(result.final_separation_arcsec, 10.0,
                            epsilon = 0.1);
        assert_eq!(solver.calls(), 3);
        assert_eq!(capture.count, 3);

        let state = mount.state.lock().unwrap();
        // Initial slew plus a re-slew after each of the two corrections.
        assert_eq!(state.slew_count, 3);
        assert_eq!(state.sync_count, 2);
    }

    #[tokio::test]
    async fn test_all_solves_fail() {
        let mount = FakeMount::default();
        let mut session = connected_session(&mount).await;
        let solver = ScriptedSolver::default();
        for _ in 0..3 {
            solver.push(Err(not_found_error("no match")));
        }
        let mut capture = FakeCapture { count: 0 };

        let target = SkyPosition::new(10.0, 20.0, Epoch::J2000);
        let mut engine = GotoEngine::new(
            &mut session, &solver, &mut capture,
            SolveRequest::default(), test_params());
        let err = engine.run(&target).await.unwrap_err();
        assert_eq!(err.code, CanonicalErrorCode::ResourceExhausted);
        assert_eq!(solver.calls(), 3);
        // No solution, so the mount was never synced.
        assert_eq!(mount.state.lock().unwrap().sync_count, 0);
    }

    #[tokio::test]
    async fn test_configuration_error_is_fatal() {
        let mount = FakeMount::default();
        let mut session = connected_session(&mount).await;
        let solver = ScriptedSolver::default();
        solver.push(Err(failed_precondition_error("engine not configured")));
        let mut capture = FakeCapture { count: 0 };

        let target = SkyPosition::new(10.0, 20.0, Epoch::J2000);
        let mut engine = GotoEngine::new(
            &mut session, &solver, &mut capture,
            SolveRequest::default(), test_params());
        let err = engine.run(&target).await.unwrap_err();
        assert_eq!(err.code, CanonicalErrorCode::FailedPrecondition);
        // No retries after a configuration failure.
        assert_eq!(solver.calls(), 1);
    }

    #[tokio::test]
    async fn test_engine_restartable() {
        let mount = FakeMount::default();
        let mut session = connected_session(&mount).await;
        let solver = ScriptedSolver::default();
        solver.push(Ok(solution_at(10.0, 20.0)));
        solver.push(Ok(solution_at(11.0, 25.0)));
        let mut capture = FakeCapture { count: 0 };

        let mut engine = GotoEngine::new(
            &mut session, &solver, &mut capture,
            SolveRequest::default(), test_params());
        let first = engine.run(
            &SkyPosition::new(10.0, 20.0, Epoch::J2000)).await.unwrap();
        assert_eq!(first.tries, 1);
        // Second run starts a fresh try budget.
        let second = engine.run(
            &SkyPosition::new(11.0, 25.0, Epoch::J2000)).await.unwrap();
        assert_eq!(second.tries, 1);
    }

    #[test]
    fn test_meridian_delay() {
        let minutes = |m: f64| (m / 60.0 * 15.0_f64).to_radians();

        assert_eq!(meridian_delay(MeridianMode::Ignore, minutes(-2.0), 5.0),
                   None);

        // Two minutes east of the meridian: wait for the crossing.
        let delay = meridian_delay(
            MeridianMode::PauseBefore, minutes(-2.0), 5.0).unwrap();
        assert!(delay >= Duration::from_secs(120));
        assert!(delay <= Duration::from_secs(135));
        // Outside the window, or already past: no pause.
        assert_eq!(meridian_delay(MeridianMode::PauseBefore,
                                  minutes(-10.0), 5.0), None);
        assert_eq!(meridian_delay(MeridianMode::PauseBefore,
                                  minutes(1.0), 5.0), None);

        // PauseAfter keeps waiting until a full window past.
        let delay = meridian_delay(
            MeridianMode::PauseAfter, minutes(1.0), 5.0).unwrap();
        assert!(delay >= Duration::from_secs(240));
        assert!(delay <= Duration::from_secs(255));
        assert_eq!(meridian_delay(MeridianMode::PauseAfter,
                                  minutes(6.0), 5.0), None);
    }
}
