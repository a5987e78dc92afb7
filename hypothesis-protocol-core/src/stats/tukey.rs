//! Distribution of the studentized range, used by Tukey's HSD.
//!
//! Gauss-Legendre integration after Copenhaver & Holland (1988), the same
//! scheme most statistical packages ship.

use statrs::function::gamma::ln_gamma;

use super::distributions::normal_cdf;

const XLEG: [f64; 6] = [
    0.981560634246719250690549090149,
    0.904117256370474856678465866119,
    0.769902674194304687036893833213,
    0.587317954286617447296702418941,
    0.367831498998180193752691536644,
    0.125233408511468915472441369464,
];

const ALEG: [f64; 6] = [
    0.047175336386511827194615961485,
    0.106939325995318430960254718194,
    0.160078328543346226334652529543,
    0.203167426723065921749064455810,
    0.233492536538354808760849898925,
    0.249147045813402785000562436043,
];

const XLEGQ: [f64; 8] = [
    0.989400934991649932596154173450,
    0.944575023073232576077988415535,
    0.865631202387831743880467897712,
    0.755404408355003033895101194847,
    0.617876244402643748446671764049,
    0.458016777657227386342419442984,
    0.281603550779258913230460501460,
    0.950125098376374401853193354250e-1,
];

const ALEGQ: [f64; 8] = [
    0.271524594117540948517805724560e-1,
    0.622535239386478928628438369944e-1,
    0.951585116824927848099251076022e-1,
    0.124628971255533872052476282192,
    0.149595988816576732081501730547,
    0.169156519395002538189312079030,
    0.182603415044923588866763667969,
    0.189450610455068496285396723208,
];

/// Probability that the range of `cc` standard normals is below `w`,
/// raised to the number of ranges `rr`.
fn wprob(w: f64, rr: f64, cc: f64) -> f64 {
    const NLEG: usize = 12;
    const IHALF: usize = 6;
    const C1: f64 = -30.0;
    const C3: f64 = 60.0;
    const BB: f64 = 8.0;
    const WLAR: f64 = 3.0;
    const WINCR1: f64 = 2.0;
    const WINCR2: f64 = 3.0;

    let qsqz = w * 0.5;
    if qsqz >= BB {
        return 1.0;
    }

    let mut pr_w = 2.0 * normal_cdf(qsqz) - 1.0;
    pr_w = if pr_w >= 1.0 { 1.0 } else { pr_w.powf(cc) };

    let wincr = if w > WLAR { WINCR1 } else { WINCR2 };
    let mut blb = qsqz;
    let binc = (BB - qsqz) / wincr;
    let mut bub = blb + binc;
    let mut einsum = 0.0;
    let cc1 = cc - 1.0;

    let mut wi = 1.0;
    while wi <= wincr {
        let mut elsum = 0.0;
        let a = 0.5 * (bub + blb);
        let b = 0.5 * (bub - blb);

        for jj in 1..=NLEG {
            let (j, xx) = if IHALF < jj {
                let j = NLEG - jj + 1;
                (j, XLEG[j - 1])
            } else {
                (jj, -XLEG[jj - 1])
            };
            let c = b * xx;
            let ac = a + c;
            let qexpo = ac * ac;
            if qexpo > C3 {
                break;
            }
            let pplus = 2.0 * normal_cdf(ac);
            let pminus = 2.0 * normal_cdf(ac - w);
            let mut rinsum = pplus * 0.5 - pminus * 0.5;
            if rinsum >= (C1 / cc1).exp() {
                rinsum = ALEG[j - 1] * (-(0.5 * qexpo)).exp() * rinsum.powf(cc1);
                elsum += rinsum;
            }
        }
        elsum *= (2.0 * b) * cc / (2.0 * std::f64::consts::PI).sqrt();
        einsum += elsum;
        blb = bub;
        bub += binc;
        wi += 1.0;
    }

    pr_w += einsum;
    if pr_w <= (C1 / rr).exp() {
        return 0.0;
    }
    pr_w = pr_w.powf(rr);
    pr_w.min(1.0)
}

/// CDF of the studentized range for `groups` means and `df` error degrees
/// of freedom. Returns NaN for invalid parameters.
pub fn ptukey(q: f64, groups: f64, df: f64) -> f64 {
    const NLEGQ: usize = 16;
    const IHALFQ: usize = 8;
    const EPS1: f64 = -30.0;
    const EPS2: f64 = 1.0e-14;
    const DHAF: f64 = 100.0;
    const DQUAR: f64 = 800.0;
    const DEIGH: f64 = 5000.0;
    const DLARG: f64 = 25000.0;
    let rr = 1.0;
    let cc = groups;

    if q <= 0.0 {
        return 0.0;
    }
    if df < 2.0 || cc < 2.0 {
        return f64::NAN;
    }
    if !q.is_finite() {
        return 1.0;
    }
    if df > DLARG {
        return wprob(q, rr, cc);
    }

    let f2 = df * 0.5;
    let mut f2lf = (f2 * df.ln()) - (df * std::f64::consts::LN_2) - ln_gamma(f2);
    let f21 = f2 - 1.0;
    let ff4 = df * 0.25;
    let ulen: f64 = if df <= DHAF {
        1.0
    } else if df <= DQUAR {
        0.5
    } else if df <= DEIGH {
        0.25
    } else {
        0.125
    };
    f2lf += ulen.ln();

    let mut ans = 0.0;
    for i in 1..=50 {
        let mut otsum = 0.0;
        let twa1 = (2 * i - 1) as f64 * ulen;

        for jj in 1..=NLEGQ {
            let (j, t1) = if IHALFQ < jj {
                let j = jj - IHALFQ - 1;
                let t1 = f2lf + f21 * (twa1 + XLEGQ[j] * ulen).ln()
                    - (XLEGQ[j] * ulen + twa1) * ff4;
                (j, t1)
            } else {
                let j = jj - 1;
                let t1 = f2lf + f21 * (twa1 - XLEGQ[j] * ulen).ln()
                    + (XLEGQ[j] * ulen - twa1) * ff4;
                (j, t1)
            };

            if t1 >= EPS1 {
                let qsqz = if IHALFQ < jj {
                    q * ((XLEGQ[j] * ulen + twa1) * 0.5).sqrt()
                } else {
                    q * ((-(XLEGQ[j] * ulen) + twa1) * 0.5).sqrt()
                };
                let wprb = wprob(qsqz, rr, cc);
                otsum += wprb * ALEGQ[j] * t1.exp();
            }
        }

        if i as f64 * ulen >= 1.0 && otsum <= EPS2 {
            break;
        }
        ans += otsum;
    }

    ans.min(1.0)
}

/// Upper tail of the studentized range: the Tukey HSD p-value for `q`.
pub fn tukey_p_value(q: f64, groups: usize, df: f64) -> f64 {
    let cdf = ptukey(q, groups as f64, df);
    if cdf.is_nan() {
        return f64::NAN;
    }
    (1.0 - cdf).clamp(0.0, 1.0)
}

/// Quantile of the studentized range, found by bisection on [`ptukey`].
pub fn qtukey(p: f64, groups: usize, df: f64) -> f64 {
    if p.is_nan() || p <= 0.0 || p >= 1.0 || groups < 2 || df < 2.0 {
        return f64::NAN;
    }
    let cc = groups as f64;
    let (mut lo, mut hi) = (0.0, 10.0);
    while ptukey(hi, cc, df) < p {
        hi *= 2.0;
        if hi > 1e4 {
            return f64::NAN;
        }
    }
    for _ in 0..60 {
        let mid = 0.5 * (lo + hi);
        if ptukey(mid, cc, df) < p {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo < 1e-6 {
            break;
        }
    }
    0.5 * (lo + hi)
}
