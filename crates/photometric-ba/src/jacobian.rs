use nalgebra::{Matrix2, Matrix2x3, Matrix2x4, Matrix2x6, Vector2, Vector3, Vector4, Vector6};

use crate::PatternVector;

/// Linearized residual of a point over its 8-pixel pattern.
///
/// The geometric blocks (`jp_*`) belong to the pattern centre and are shared by
/// all pattern pixels. The photometric columns `j_idx` (image gradient) and
/// `j_ab` (relative affine) are per pixel and carry the square root of the
/// robust weight, as does `res`.
#[derive(Clone, Debug, PartialEq)]
pub struct PointJacobian {
    pub(crate) res: PatternVector,
    pub(crate) jp_dxi: Matrix2x6<f64>,
    pub(crate) jp_dc: Matrix2x4<f64>,
    pub(crate) jp_dd: Vector2<f64>,
    pub(crate) j_idx: [PatternVector; 2],
    pub(crate) j_ab: [PatternVector; 2],
    pub(crate) j_idx2: Matrix2<f64>,
    pub(crate) jab_jidx: Matrix2<f64>,
    pub(crate) jab2: Matrix2<f64>,
}

impl PointJacobian {
    pub(crate) fn zeros() -> Self {
        Self {
            res: PatternVector::zeros(),
            jp_dxi: Matrix2x6::zeros(),
            jp_dc: Matrix2x4::zeros(),
            jp_dd: Vector2::zeros(),
            j_idx: [PatternVector::zeros(); 2],
            j_ab: [PatternVector::zeros(); 2],
            j_idx2: Matrix2::zeros(),
            jab_jidx: Matrix2::zeros(),
            jab2: Matrix2::zeros(),
        }
    }

    pub(crate) fn compute_shorthands(&mut self) {
        for i in 0..2 {
            for j in 0..2 {
                self.j_idx2[(i, j)] = self.j_idx[i].dot(&self.j_idx[j]);
                self.jab_jidx[(i, j)] = self.j_ab[i].dot(&self.j_idx[j]);
                self.jab2[(i, j)] = self.j_ab[i].dot(&self.j_ab[j]);
            }
        }
    }

    pub fn residual(&self) -> &PatternVector {
        &self.res
    }

    pub fn jp_dxi(&self) -> &Matrix2x6<f64> {
        &self.jp_dxi
    }

    pub fn jp_dc(&self) -> &Matrix2x4<f64> {
        &self.jp_dc
    }

    pub fn jp_dd(&self) -> &Vector2<f64> {
        &self.jp_dd
    }

    /// `Σ_k g_k r_k` and `Σ_k jab_k r_k` for a residual vector `r`.
    pub(crate) fn projected_residual(&self, r: &PatternVector) -> (Vector2<f64>, Vector2<f64>) {
        (
            Vector2::new(self.j_idx[0].dot(r), self.j_idx[1].dot(r)),
            Vector2::new(self.j_ab[0].dot(r), self.j_ab[1].dot(r)),
        )
    }

    /// First-order change of the residual vector for relative increments of
    /// intrinsics, pose, affine and inverse depth.
    pub(crate) fn residual_change(
        &self,
        dc: &Vector4<f64>,
        dxi: &Vector6<f64>,
        dab: &Vector2<f64>,
        dd: f64,
    ) -> PatternVector {
        let pixel_shift = self.jp_dc * dc + self.jp_dxi * dxi + self.jp_dd * dd;
        self.j_idx[0] * pixel_shift.x
            + self.j_idx[1] * pixel_shift.y
            + self.j_ab[0] * dab.x
            + self.j_ab[1] * dab.y
    }
}

/// Linearized residual of a plane. Every pixel has its own geometric
/// Jacobian, so the blocks are stored per pixel.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct PlaneJacobian {
    pub(crate) res: Vec<f64>,
    pub(crate) jp_dxi: Vec<Matrix2x6<f64>>,
    pub(crate) jp_dc: Vec<Matrix2x4<f64>>,
    pub(crate) jp_dn: Vec<Matrix2x3<f64>>,
    pub(crate) j_idx: Vec<Vector2<f64>>,
    pub(crate) j_ab: Vec<Vector2<f64>>,
    pub(crate) j_idx2: Vec<Matrix2<f64>>,
    pub(crate) jab_jidx: Vec<Matrix2<f64>>,
    pub(crate) jab2: Vec<Matrix2<f64>>,
}

impl PlaneJacobian {
    pub(crate) fn with_capacity(pixels: usize) -> Self {
        Self {
            res: Vec::with_capacity(pixels),
            jp_dxi: Vec::with_capacity(pixels),
            jp_dc: Vec::with_capacity(pixels),
            jp_dn: Vec::with_capacity(pixels),
            j_idx: Vec::with_capacity(pixels),
            j_ab: Vec::with_capacity(pixels),
            j_idx2: Vec::with_capacity(pixels),
            jab_jidx: Vec::with_capacity(pixels),
            jab2: Vec::with_capacity(pixels),
        }
    }

    pub fn len(&self) -> usize {
        self.res.len()
    }

    pub fn is_empty(&self) -> bool {
        self.res.is_empty()
    }

    pub fn residual(&self) -> &[f64] {
        &self.res
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn push(
        &mut self,
        res: f64,
        jp_dxi: Matrix2x6<f64>,
        jp_dc: Matrix2x4<f64>,
        jp_dn: Matrix2x3<f64>,
        j_idx: Vector2<f64>,
        j_ab: Vector2<f64>,
    ) {
        self.res.push(res);
        self.jp_dxi.push(jp_dxi);
        self.jp_dc.push(jp_dc);
        self.jp_dn.push(jp_dn);
        self.j_idx2.push(j_idx * j_idx.transpose());
        self.jab_jidx.push(j_ab * j_idx.transpose());
        self.jab2.push(j_ab * j_ab.transpose());
        self.j_idx.push(j_idx);
        self.j_ab.push(j_ab);
    }

    pub(crate) fn residual_change(
        &self,
        dc: &Vector4<f64>,
        dxi: &Vector6<f64>,
        dab: &Vector2<f64>,
        dn: &Vector3<f64>,
    ) -> Vec<f64> {
        (0..self.len())
            .map(|k| {
                let shift = self.jp_dc[k] * dc + self.jp_dxi[k] * dxi + self.jp_dn[k] * dn;
                self.j_idx[k].dot(&shift) + self.j_ab[k].dot(dab)
            })
            .collect()
    }
}
