use ndarray::{arr2, Array4, ArrayD, IxDyn};

use gradviz::vis::style::{
    content_grad, content_loss, gram_matrix, style_layer_grad, style_layer_loss, tv_grad, tv_loss,
};

fn feature_map(values: Vec<f32>, channels: usize, height: usize, width: usize) -> ArrayD<f32> {
    ArrayD::from_shape_vec(IxDyn(&[1, channels, height, width]), values).unwrap()
}

fn relative_error(actual: f32, expected: f32) -> f32 {
    (actual - expected).abs() / expected.abs().max(1e-12)
}

#[test]
fn content_loss_of_a_zero_candidate_is_the_weighted_energy() {
    let target = feature_map(vec![1.0, -2.0, 3.0, 0.5, -0.5, 2.0, 1.5, -1.0], 2, 2, 2);
    let candidate = ArrayD::zeros(target.raw_dim());

    let weight = 6e-2;
    // sum of squares: 1 + 4 + 9 + 0.25 + 0.25 + 4 + 2.25 + 1 = 21.75
    let expected = weight * 21.75;
    let loss = content_loss(weight, &candidate, &target);
    assert!(relative_error(loss, expected) < 1e-8);
}

#[test]
fn content_grad_is_twice_the_weighted_difference() {
    let target = feature_map(vec![1.0, 2.0, 3.0, 4.0], 1, 2, 2);
    let candidate = feature_map(vec![2.0, 2.0, 0.0, 4.0], 1, 2, 2);

    let grad = content_grad(0.5, &candidate, &target);
    let expected = feature_map(vec![1.0, 0.0, -3.0, 0.0], 1, 2, 2);
    assert!((grad - expected).mapv(f32::abs).sum() < 1e-6);
}

#[test]
fn gram_matrix_matches_hand_computed_reference() {
    // channel 0: [[1, 2], [3, 4]], channel 1: [[0, 1], [0, -1]]
    let features = feature_map(vec![1.0, 2.0, 3.0, 4.0, 0.0, 1.0, 0.0, -1.0], 2, 2, 2);

    let gram = gram_matrix(&features, false).unwrap();
    let expected = arr2(&[[30.0_f32, -2.0], [-2.0, 2.0]]);
    for (a, b) in gram.iter().zip(expected.iter()) {
        assert!(relative_error(*a, *b) < 1e-3 || (a - b).abs() < 1e-6);
    }

    let normalized = gram_matrix(&features, true).unwrap();
    assert!(relative_error(normalized[[0, 0]], 30.0 / 8.0) < 1e-3);
}

#[test]
fn style_loss_matches_hand_computed_reference() {
    let features = feature_map(vec![1.0, 2.0, 3.0, 4.0, 0.0, 1.0, 0.0, -1.0], 2, 2, 2);
    // target gram differs by [[2, 1], [1, -1]] from the candidate's
    let target = arr2(&[[28.0_f32, -3.0], [-3.0, 3.0]]);

    let weight = 0.25;
    // squared differences: 4 + 1 + 1 + 1 = 7
    let expected = weight * 7.0;
    let loss = style_layer_loss(weight, &features, &target, false).unwrap();
    assert!(relative_error(loss, expected) < 1e-3);
}

#[test]
fn style_grad_matches_finite_differences() {
    let features = feature_map(
        vec![0.5, -0.3, 0.8, 0.1, 0.2, 0.9, -0.4, 0.6, 0.0, 0.7, -0.2, 0.3],
        3,
        2,
        2,
    );
    let target = arr2(&[
        [0.4_f32, 0.1, 0.0],
        [0.1, 0.5, -0.1],
        [0.0, -0.1, 0.3],
    ]);
    let weight = 0.7;

    let analytic = style_layer_grad(weight, &features, &target, true).unwrap();

    let step = 1e-2;
    let mut numeric = ArrayD::<f32>::zeros(features.raw_dim());
    let indices: Vec<IxDyn> = features.indexed_iter().map(|(idx, _)| idx).collect();
    for idx in indices {
        let mut plus = features.clone();
        plus[idx.clone()] += step;
        let mut minus = features.clone();
        minus[idx.clone()] -= step;
        let delta = (style_layer_loss(weight, &plus, &target, true).unwrap()
            - style_layer_loss(weight, &minus, &target, true).unwrap())
            / (2.0 * step);
        numeric[idx] = delta;
    }

    let err = (&analytic - &numeric).mapv(f32::abs).mean().unwrap();
    assert!(err < 1e-3);
}

#[test]
fn tv_loss_matches_hand_computed_reference() {
    // single channel [[1, 2], [3, 5]]
    let image = Array4::from_shape_vec((1, 1, 2, 2), vec![1.0, 2.0, 3.0, 5.0]).unwrap();

    let weight = 5e-2;
    // vertical: (3-1)^2 + (5-2)^2 = 13, horizontal: (2-1)^2 + (5-3)^2 = 5
    let expected = weight * 18.0;
    let loss = tv_loss(&image, weight);
    assert!(relative_error(loss, expected) < 1e-3);
}

#[test]
fn tv_loss_sums_over_channels() {
    let image = Array4::from_shape_vec(
        (1, 2, 2, 2),
        vec![1.0, 2.0, 3.0, 5.0, 1.0, 2.0, 3.0, 5.0],
    )
    .unwrap();
    let loss = tv_loss(&image, 1.0);
    assert!(relative_error(loss, 36.0) < 1e-3);
}

#[test]
fn tv_grad_matches_finite_differences() {
    let image = Array4::from_shape_fn((1, 2, 3, 4), |(_, c, h, w)| {
        0.3 * (c as f32) - 0.2 * (h as f32) + 0.1 * (w as f32) * (h as f32 + 1.0)
    });
    let weight = 0.4;

    let analytic = tv_grad(&image, weight);

    let step = 1e-2;
    let mut numeric = Array4::<f32>::zeros(image.raw_dim());
    for b in 0..1 {
        for c in 0..2 {
            for h in 0..3 {
                for w in 0..4 {
                    let mut plus = image.clone();
                    plus[[b, c, h, w]] += step;
                    let mut minus = image.clone();
                    minus[[b, c, h, w]] -= step;
                    numeric[[b, c, h, w]] =
                        (tv_loss(&plus, weight) - tv_loss(&minus, weight)) / (2.0 * step);
                }
            }
        }
    }

    let err = (&analytic - &numeric).mapv(f32::abs).mean().unwrap();
    assert!(err < 1e-3);
}

#[test]
fn bad_feature_shapes_are_rejected() {
    let batch_of_two = ArrayD::<f32>::zeros(IxDyn(&[2, 2, 2, 2]));
    assert!(gram_matrix(&batch_of_two, true).is_err());

    let rank_two = ArrayD::<f32>::zeros(IxDyn(&[4, 4]));
    assert!(gram_matrix(&rank_two, true).is_err());
}
