use crate::error::DesignError;
use log::debug;
use serde::Deserialize;
use std::time::Duration;

const UMELT_URL: &str = "https://www.dna.utah.edu/db/services/cgi-bin/udesign.cgi";

/// The temperature axis the service reports helicity over: 65.0 to 100.0
/// inclusive in 0.5 degree steps.
const CURVE_MIN_TEMP: f64 = 65.0;
const CURVE_MAX_TEMP: f64 = 100.5;
const CURVE_STEP: f64 = 0.5;

/// One melting prediction request.
#[derive(Debug, Clone)]
pub struct MeltRequest {
    pub sequence: String,
    pub resolution: u32,
    pub dmso_percent: f64,
    /// Monovalent cation concentration in mM.
    pub cations: f64,
    /// Free magnesium concentration in mM.
    pub free_mg: f64,
}

impl MeltRequest {
    pub fn new(sequence: &str) -> Self {
        MeltRequest {
            sequence: sequence.to_string(),
            resolution: 0,
            dmso_percent: 0.0,
            cations: 20.0,
            free_mg: 2.0,
        }
    }
}

/// Client for the uMelt uDesign web service.
#[derive(Debug, Clone)]
pub struct MeltClient {
    url: String,
    timeout: Duration,
}

impl Default for MeltClient {
    fn default() -> Self {
        MeltClient {
            url: UMELT_URL.to_string(),
            timeout: Duration::from_secs(500),
        }
    }
}

impl MeltClient {
    pub fn with_url(url: &str) -> Self {
        MeltClient {
            url: url.to_string(),
            ..Default::default()
        }
    }

    /// Query the service and decode the helicity curve of the amplicon.
    pub fn fetch_helicity(&self, request: &MeltRequest) -> Result<HelicityCurve, DesignError> {
        debug!("Querying melt service for {} bp", request.sequence.len());
        let response = ureq::get(&self.url)
            .query("seq", &request.sequence)
            .query("rs", &request.resolution.to_string())
            .query("dmso", &request.dmso_percent.to_string())
            .query("cation", &request.cations.to_string())
            .query("mg", &request.free_mg.to_string())
            .timeout(self.timeout)
            .call()
            .map_err(|e| DesignError::MeltService(format!("request failed: {e}")))?;
        let body = response
            .into_string()
            .map_err(|e| DesignError::MeltService(format!("unreadable response: {e}")))?;
        parse_melt_response(&body)
    }
}

#[derive(Debug, Deserialize)]
struct MeltResponseXml {
    #[serde(rename = "amplicon", default)]
    amplicons: Vec<AmpliconXml>,
}

#[derive(Debug, Deserialize)]
struct AmpliconXml {
    helicity: Option<String>,
}

/// Decode the service XML. The response carries one identical helicity
/// series per virtual channel; only the first is used.
pub fn parse_melt_response(xml: &str) -> Result<HelicityCurve, DesignError> {
    let parsed: MeltResponseXml = quick_xml::de::from_str(xml)
        .map_err(|e| DesignError::MeltService(format!("malformed melt XML: {e}")))?;
    let series = parsed
        .amplicons
        .first()
        .and_then(|amp| amp.helicity.as_ref())
        .ok_or_else(|| DesignError::MeltService("no amplicon helicity in response".to_string()))?;
    let helicity: Vec<f64> = series
        .split_whitespace()
        .map(|v| {
            v.parse::<f64>()
                .map_err(|e| DesignError::MeltService(format!("bad helicity value {v:?}: {e}")))
        })
        .collect::<Result<_, _>>()?;
    HelicityCurve::from_helicity(helicity)
}

/// A temperature vs. helicity-percent series.
#[derive(Debug, Clone)]
pub struct HelicityCurve {
    pub temperatures: Vec<f64>,
    pub helicity: Vec<f64>,
}

impl HelicityCurve {
    /// Pair a helicity series with the service's standard temperature axis.
    pub fn from_helicity(helicity: Vec<f64>) -> Result<Self, DesignError> {
        if helicity.len() < 4 {
            return Err(DesignError::MeltService(format!(
                "helicity series too short ({} points)",
                helicity.len()
            )));
        }
        let expected = ((CURVE_MAX_TEMP - CURVE_MIN_TEMP) / CURVE_STEP).ceil() as usize;
        let temperatures = if helicity.len() == expected {
            (0..expected)
                .map(|i| CURVE_MIN_TEMP + i as f64 * CURVE_STEP)
                .collect()
        } else {
            linspace(CURVE_MIN_TEMP, CURVE_MAX_TEMP, helicity.len())
        };
        Ok(HelicityCurve {
            temperatures,
            helicity,
        })
    }

    /// Melting temperature: the point of steepest helicity loss, read off a
    /// spline fit evaluated at ten times the input resolution.
    pub fn melting_temp(&self) -> f64 {
        let spline = CubicSpline::fit(&self.temperatures, &self.helicity);
        let grid = linspace(CURVE_MIN_TEMP, CURVE_MAX_TEMP, self.helicity.len() * 10);
        let mut best_temp = grid[0];
        let mut best_slope = f64::INFINITY;
        for &temp in &grid {
            let slope = spline.derivative(temp);
            if slope < best_slope {
                best_slope = slope;
                best_temp = temp;
            }
        }
        best_temp
    }
}

fn linspace(start: f64, stop: f64, count: usize) -> Vec<f64> {
    if count == 1 {
        return vec![start];
    }
    let step = (stop - start) / (count - 1) as f64;
    (0..count).map(|i| start + i as f64 * step).collect()
}

/// Natural cubic spline through strictly increasing knots.
struct CubicSpline {
    xs: Vec<f64>,
    ys: Vec<f64>,
    /// Second derivatives at the knots.
    moments: Vec<f64>,
}

impl CubicSpline {
    fn fit(xs: &[f64], ys: &[f64]) -> Self {
        let n = xs.len();
        let mut moments = vec![0.0; n];
        if n > 2 {
            // Tridiagonal system for the interior second derivatives,
            // solved by forward elimination and back substitution.
            let m = n - 2;
            let mut diag = vec![0.0; m];
            let mut upper = vec![0.0; m];
            let mut rhs = vec![0.0; m];
            for i in 0..m {
                let h0 = xs[i + 1] - xs[i];
                let h1 = xs[i + 2] - xs[i + 1];
                diag[i] = 2.0 * (h0 + h1);
                upper[i] = h1;
                rhs[i] = 6.0 * ((ys[i + 2] - ys[i + 1]) / h1 - (ys[i + 1] - ys[i]) / h0);
            }
            for i in 1..m {
                let lower = xs[i + 1] - xs[i];
                let factor = lower / diag[i - 1];
                diag[i] -= factor * upper[i - 1];
                rhs[i] -= factor * rhs[i - 1];
            }
            moments[m] = rhs[m - 1] / diag[m - 1];
            for i in (0..m - 1).rev() {
                moments[i + 1] = (rhs[i] - upper[i] * moments[i + 2]) / diag[i];
            }
        }
        CubicSpline {
            xs: xs.to_vec(),
            ys: ys.to_vec(),
            moments,
        }
    }

    /// First derivative at `x`, extrapolating the end segments.
    fn derivative(&self, x: f64) -> f64 {
        let n = self.xs.len();
        let mut i = match self
            .xs
            .binary_search_by(|probe| probe.total_cmp(&x))
        {
            Ok(idx) => idx,
            Err(idx) => idx.saturating_sub(1),
        };
        i = i.min(n - 2);
        let h = self.xs[i + 1] - self.xs[i];
        let a = (self.xs[i + 1] - x) / h;
        let b = (x - self.xs[i]) / h;
        (self.ys[i + 1] - self.ys[i]) / h
            - (3.0 * a * a - 1.0) / 6.0 * h * self.moments[i]
            + (3.0 * b * b - 1.0) / 6.0 * h * self.moments[i + 1]
    }
}
