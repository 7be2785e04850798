use bifrost::quadrature::QuadratureRule;
use bifrost::space::ReferenceGeometry;
use matrixcompare::assert_scalar_eq;

fn integrate_1d(rule: &QuadratureRule<f64>, f: impl Fn(f64) -> f64) -> f64 {
    rule.iter().map(|(w, x)| w * f(x[0])).sum()
}

#[test]
fn gauss_1d_integrates_polynomials_exactly() {
    for order in 0..10 {
        let rule = QuadratureRule::gauss_1d(order);
        for power in 0..=order {
            let integral = integrate_1d(&rule, |x| x.powi(power as i32));
            let expected = 1.0 / (power + 1) as f64;
            assert_scalar_eq!(integral, expected, comp = abs, tol = 1e-14);
        }
    }
}

#[test]
fn gauss_1d_point_count_matches_order() {
    // 2n - 1 >= order must hold for the chosen point count n
    for order in 0..12 {
        let rule: QuadratureRule<f64> = QuadratureRule::gauss_1d(order);
        assert!(2 * rule.num_points() - 1 >= order);
    }
}

#[test]
fn tensor_rules_integrate_monomials_exactly() {
    let rule: QuadratureRule<f64> = QuadratureRule::gauss(ReferenceGeometry::Quadrilateral, 4);
    let integral: f64 = rule.iter().map(|(w, p)| w * p[0].powi(4) * p[1].powi(3)).sum();
    assert_scalar_eq!(integral, 1.0 / 5.0 * 1.0 / 4.0, comp = abs, tol = 1e-14);

    let rule: QuadratureRule<f64> = QuadratureRule::gauss(ReferenceGeometry::Hexahedron, 3);
    let integral: f64 = rule
        .iter()
        .map(|(w, p)| w * p[0] * p[1].powi(2) * p[2].powi(3))
        .sum();
    assert_scalar_eq!(integral, 0.5 * (1.0 / 3.0) * 0.25, comp = abs, tol = 1e-14);
}

#[test]
fn weights_sum_to_reference_volume() {
    for geometry in [
        ReferenceGeometry::Segment,
        ReferenceGeometry::Quadrilateral,
        ReferenceGeometry::Hexahedron,
    ] {
        let rule = QuadratureRule::gauss(geometry, 5);
        let volume: f64 = rule.weights().iter().sum();
        assert_scalar_eq!(volume, 1.0, comp = abs, tol = 1e-14);
    }
}
