//! Bounded Nelder-Mead simplex minimizer.
//!
//! Derivative-free, which is what the calibration objective needs: each
//! evaluation runs a full surface reprice through the Fourier pricer and an
//! implied-vol inversion, so gradients are unavailable and noisy. Box
//! constraints are enforced by clamping every candidate vertex.

/// Standard reflection/expansion/contraction/shrink coefficients.
const ALPHA: f64 = 1.0;
const GAMMA: f64 = 2.0;
const RHO: f64 = 0.5;
const SIGMA: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
pub struct OptimOptions {
    pub max_iters: usize,
    /// Convergence when the simplex function-value spread falls below this.
    pub tol: f64,
}

impl Default for OptimOptions {
    fn default() -> Self {
        Self {
            max_iters: 200,
            tol: 1e-8,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OptimOutcome<const N: usize> {
    pub x: [f64; N],
    pub fx: f64,
    pub iterations: usize,
    pub converged: bool,
}

fn clamp<const N: usize>(x: &mut [f64; N], bounds: &[(f64, f64); N]) {
    for i in 0..N {
        x[i] = x[i].clamp(bounds[i].0, bounds[i].1);
    }
}

fn centroid<const N: usize>(vertices: &[[f64; N]], exclude: usize) -> [f64; N] {
    let mut c = [0.0; N];
    let count = (vertices.len() - 1) as f64;
    for (i, v) in vertices.iter().enumerate() {
        if i == exclude {
            continue;
        }
        for d in 0..N {
            c[d] += v[d] / count;
        }
    }
    c
}

/// Minimize `f` over the box `bounds` starting from `x0`.
///
/// The initial simplex perturbs each coordinate by 5% of its box width,
/// reflecting inward when that would leave the box. Evaluation count is
/// bounded by `max_iters` simplex steps.
pub fn nelder_mead<const N: usize, F>(
    mut f: F,
    x0: [f64; N],
    bounds: &[(f64, f64); N],
    opts: OptimOptions,
) -> OptimOutcome<N>
where
    F: FnMut(&[f64; N]) -> f64,
{
    let mut start = x0;
    clamp(&mut start, bounds);

    // N+1 vertices: the start plus one axis perturbation each.
    let mut vertices: Vec<[f64; N]> = Vec::with_capacity(N + 1);
    vertices.push(start);
    for d in 0..N {
        let mut v = start;
        let step = 0.05 * (bounds[d].1 - bounds[d].0);
        v[d] = if v[d] + step <= bounds[d].1 {
            v[d] + step
        } else {
            v[d] - step
        };
        clamp(&mut v, bounds);
        vertices.push(v);
    }
    let mut values: Vec<f64> = vertices.iter().map(|v| f(v)).collect();

    let mut iterations = 0;
    let mut converged = false;

    while iterations < opts.max_iters {
        iterations += 1;

        // Order best..worst by value (indices into vertices/values).
        let mut order: Vec<usize> = (0..vertices.len()).collect();
        order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
        let best = order[0];
        let worst = order[order.len() - 1];
        let second_worst = order[order.len() - 2];

        if (values[worst] - values[best]).abs() < opts.tol {
            converged = true;
            break;
        }

        let c = centroid(&vertices, worst);

        // Reflect.
        let mut xr = [0.0; N];
        for d in 0..N {
            xr[d] = c[d] + ALPHA * (c[d] - vertices[worst][d]);
        }
        clamp(&mut xr, bounds);
        let fr = f(&xr);

        if fr < values[best] {
            // Expand.
            let mut xe = [0.0; N];
            for d in 0..N {
                xe[d] = c[d] + GAMMA * (xr[d] - c[d]);
            }
            clamp(&mut xe, bounds);
            let fe = f(&xe);
            if fe < fr {
                vertices[worst] = xe;
                values[worst] = fe;
            } else {
                vertices[worst] = xr;
                values[worst] = fr;
            }
            continue;
        }

        if fr < values[second_worst] {
            vertices[worst] = xr;
            values[worst] = fr;
            continue;
        }

        // Contract toward the centroid.
        let mut xc = [0.0; N];
        for d in 0..N {
            xc[d] = c[d] + RHO * (vertices[worst][d] - c[d]);
        }
        clamp(&mut xc, bounds);
        let fc = f(&xc);
        if fc < values[worst] {
            vertices[worst] = xc;
            values[worst] = fc;
            continue;
        }

        // Shrink everything toward the best vertex.
        let best_v = vertices[best];
        for i in 0..vertices.len() {
            if i == best {
                continue;
            }
            for d in 0..N {
                vertices[i][d] = best_v[d] + SIGMA * (vertices[i][d] - best_v[d]);
            }
            clamp(&mut vertices[i], bounds);
            values[i] = f(&vertices[i]);
        }
    }

    let mut best_i = 0;
    for i in 1..values.len() {
        if values[i] < values[best_i] {
            best_i = i;
        }
    }
    OptimOutcome {
        x: vertices[best_i],
        fx: values[best_i],
        iterations,
        converged,
    }
}
